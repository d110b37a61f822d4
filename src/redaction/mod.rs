// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Redaction plans proposed by the planner and their validation
//!
//! Planner output is untrusted: every rectangle goes through
//! [`validate_plan`] before it reaches the pixel-redaction primitive.

pub mod apply;
pub mod plan;
pub mod validator;

pub use apply::PixelRedactor;
pub use plan::{PlannedRedaction, RedactionPlan, RedactionStyle};
pub use validator::{validate_plan, DEFAULT_INTENSITY, DEFAULT_REASON};

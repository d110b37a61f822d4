// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Collaborators owned by the editing session
//!
//! The redactor never renders, stores files or mutates pixels itself. It talks
//! to the session through these traits:
//! - [`ImageStore`] - current RGBA buffer and its mutator
//! - [`UndoHistory`] - append-only command log shared with manual tools
//! - [`RedactionApplier`] - the solid/pixelate/blur primitive
//! - [`KeyStore`] - session-scoped secret storage for the remote API key

use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;

use crate::detection::BoundingBox;
use crate::redaction::{PlannedRedaction, RedactionStyle};

/// Fixed name the remote API key is stored under
pub const API_KEY_NAME: &str = "ralph_lisa_api_key";

/// Holds the image currently being edited
pub trait ImageStore: Send + Sync {
    fn current(&self) -> Option<Arc<RgbaImage>>;
    fn update_current(&self, image: RgbaImage);
}

/// One entry of the undo log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EditCommand {
    Rect {
        style: RedactionStyle,
        region: BoundingBox,
        intensity: u8,
        color: [u8; 3],
    },
    Brush {
        style: RedactionStyle,
        points: Vec<(u32, u32)>,
        intensity: u8,
        color: [u8; 3],
    },
}

impl EditCommand {
    /// Rect command recording an applied planner redaction
    pub fn from_redaction(redaction: &PlannedRedaction) -> Self {
        EditCommand::Rect {
            style: redaction.style,
            region: BoundingBox::new(redaction.x, redaction.y, redaction.width, redaction.height),
            intensity: redaction.intensity,
            color: [0, 0, 0],
        }
    }
}

/// Append-only command log
pub trait UndoHistory: Send + Sync {
    fn push(&self, command: EditCommand);
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("Region {x},{y} {width}x{height} outside {image_width}x{image_height} image")]
    OutOfBounds {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        image_width: u32,
        image_height: u32,
    },
    #[error("Redaction failed: {0}")]
    Failed(String),
}

/// Pixel-redaction primitive (solid fill, pixelate, blur)
pub trait RedactionApplier: Send + Sync {
    fn apply(&self, image: &mut RgbaImage, redaction: &PlannedRedaction) -> Result<(), ApplyError>;
}

/// Session-scoped secret storage
pub trait KeyStore: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
    fn set(&self, name: &str, value: &str);
    fn remove(&self, name: &str);
}

/// Image store for embedding applications and tests
#[derive(Debug, Default)]
pub struct InMemoryImageStore {
    current: RwLock<Option<Arc<RgbaImage>>>,
}

impl InMemoryImageStore {
    pub fn new(image: Option<RgbaImage>) -> Self {
        Self {
            current: RwLock::new(image.map(Arc::new)),
        }
    }
}

impl ImageStore for InMemoryImageStore {
    fn current(&self) -> Option<Arc<RgbaImage>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn update_current(&self, image: RgbaImage) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(image));
    }
}

/// Undo log kept in memory
#[derive(Debug, Default)]
pub struct InMemoryHistory {
    commands: Mutex<Vec<EditCommand>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> Vec<EditCommand> {
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.commands.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl UndoHistory for InMemoryHistory {
    fn push(&self, command: EditCommand) {
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(command);
    }
}

/// Key store that lives as long as the session
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn get(&self, name: &str) -> Option<String> {
        self.values
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    fn set(&self, name: &str, value: &str) {
        self.values
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), value.to_string());
    }

    fn remove(&self, name: &str) {
        self.values
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }
}

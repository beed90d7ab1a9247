//! Annotation class definitions.
//!
//! Classes are stored in the model bundle as a JSON document:
//!
//! ```json
//! { "anno_classes": [ { "name": "clean", "color": { "red": 0, "green": 255, "blue": 0, "alpha": 64 } } ] }
//! ```
//!
//! An empty document selects the built-in two-class set. The parsed
//! [`AnnoClasses`] are constructed once per run and shared read-only by
//! every pipeline stage.

use std::collections::HashMap;

use serde::Deserialize;

use crate::types::{AnnoClass, ConfigError, IGNORE_LABEL, Rgba};

#[derive(Deserialize)]
struct AnnoClassesDocument {
    anno_classes: Vec<AnnoClassEntry>,
}

#[derive(Deserialize)]
struct AnnoClassEntry {
    name: String,
    color: Rgba,
}

/// The validated, immutable list of annotation classes.
///
/// Indices are dense and contiguous from 0, colors are unique, and the
/// reserved ignore color never maps to a class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnoClasses {
    classes: Vec<AnnoClass>,
    by_color: HashMap<Rgba, u16>,
}

impl AnnoClasses {
    /// Parse a class-definition document.
    ///
    /// An empty (or whitespace-only) document yields [`Self::defaults`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::AnnoClassesJson`] for malformed JSON or a
    /// missing `anno_classes` array, and the errors of [`Self::new`] for
    /// invalid class sets.
    pub fn parse(json: &str) -> Result<Self, ConfigError> {
        if json.trim().is_empty() {
            return Ok(Self::defaults());
        }

        let document: AnnoClassesDocument = serde_json::from_str(json)?;
        Self::new(
            document
                .anno_classes
                .into_iter()
                .map(|entry| (entry.name, entry.color)),
        )
    }

    /// Build a class set from `(name, color)` pairs, assigning indices in
    /// order.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ReservedColor`] if any class uses
    /// [`Rgba::IGNORE`], [`ConfigError::DuplicateColor`] if two classes
    /// share a color, and [`ConfigError::TooFewClasses`] /
    /// [`ConfigError::TooManyClasses`] for out-of-range class counts.
    pub fn new(entries: impl IntoIterator<Item = (String, Rgba)>) -> Result<Self, ConfigError> {
        let mut classes: Vec<AnnoClass> = Vec::new();
        let mut by_color = HashMap::new();

        for (name, color) in entries {
            if color.is_ignore() {
                return Err(ConfigError::ReservedColor { name });
            }
            let index = u16::try_from(classes.len())
                .ok()
                .filter(|&i| i != IGNORE_LABEL)
                .ok_or(ConfigError::TooManyClasses(classes.len() + 1))?;
            if let Some(&existing) = by_color.get(&color) {
                return Err(ConfigError::DuplicateColor {
                    first: classes[usize::from(existing)].name.clone(),
                    second: name,
                    color,
                });
            }
            by_color.insert(color, index);
            classes.push(AnnoClass { index, color, name });
        }

        if classes.len() < 2 {
            return Err(ConfigError::TooFewClasses(classes.len()));
        }

        Ok(Self { classes, by_color })
    }

    /// The built-in class set used when a bundle carries no definitions.
    #[must_use]
    pub fn defaults() -> Self {
        let classes = vec![
            AnnoClass {
                index: 0,
                color: Rgba::new(0, 255, 0, 64),
                name: "clean".to_owned(),
            },
            AnnoClass {
                index: 1,
                color: Rgba::new(255, 0, 0, 128),
                name: "defect".to_owned(),
            },
        ];
        let by_color = classes.iter().map(|c| (c.color, c.index)).collect();
        Self { classes, by_color }
    }

    /// Number of classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Always `false`: a validated set holds at least two classes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Class by index.
    #[must_use]
    pub fn get(&self, index: u16) -> Option<&AnnoClass> {
        self.classes.get(usize::from(index))
    }

    /// Map a label color to its class index.
    ///
    /// Returns `Some(IGNORE_LABEL)` for the reserved ignore color and
    /// `None` for colors that belong to no class.
    #[must_use]
    pub fn index_of(&self, color: Rgba) -> Option<u16> {
        if color.is_ignore() {
            return Some(IGNORE_LABEL);
        }
        self.by_color.get(&color).copied()
    }

    /// Iterate over classes in index order.
    pub fn iter(&self) -> impl Iterator<Item = &AnnoClass> {
        self.classes.iter()
    }
}

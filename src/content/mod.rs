//! Sectioned site content: sections, their pages and page banners.
//!
//! The catalog is read-only at runtime. It is loaded once at startup from a
//! JSON file and shared by the handlers.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use utoipa::ToSchema;

/// Preview length used when a section does not set its own.
pub const DEFAULT_PREVIEW_LENGTH: u32 = 300;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("permalink `{0}` may only contain letters and digits")]
    InvalidPermalink(String),
    #[error("section `{0}` needs a title")]
    MissingTitle(String),
    #[error("section `{permalink}` preview length {length} must be greater than 3")]
    PreviewTooShort { permalink: String, length: u32 },
    #[error("section `{0}` already exists")]
    DuplicatePermalink(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Banner {
    pub file_name: String,
    #[serde(default)]
    pub linked_url: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Page {
    pub permalink: String,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub position: i32,
    #[serde(default)]
    pub banner: Option<Banner>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Section {
    pub permalink: String,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub preview_length: Option<u32>,
    #[serde(default)]
    pub position: i32,
    #[serde(default)]
    pub pages: Vec<Page>,
}

impl Section {
    #[must_use]
    pub fn new(permalink: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            permalink: permalink.into(),
            title: title.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn at(mut self, position: i32) -> Self {
        self.position = position;
        self
    }

    #[must_use]
    pub const fn with_preview_length(mut self, length: u32) -> Self {
        self.preview_length = Some(length);
        self
    }

    #[must_use]
    pub fn with_page(mut self, page: Page) -> Self {
        self.pages.push(page);
        self
    }

    /// # Errors
    /// Returns the first rule the section breaks.
    pub fn validate(&self) -> Result<(), CatalogError> {
        if !valid_permalink(&self.permalink) {
            return Err(CatalogError::InvalidPermalink(self.permalink.clone()));
        }
        if self.title.trim().is_empty() {
            return Err(CatalogError::MissingTitle(self.permalink.clone()));
        }
        match self.preview_length {
            Some(length) if length <= 3 => Err(CatalogError::PreviewTooShort {
                permalink: self.permalink.clone(),
                length,
            }),
            _ => Ok(()),
        }
    }
}

#[must_use]
pub fn valid_permalink(permalink: &str) -> bool {
    Regex::new(r"^[A-Za-z0-9]+$").is_ok_and(|re| re.is_match(permalink))
}

/// Ordered set of sections keyed by permalink.
#[derive(Clone, Debug)]
pub struct Catalog {
    sections: Vec<Section>,
    default_preview_length: u32,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new(DEFAULT_PREVIEW_LENGTH)
    }
}

impl Catalog {
    #[must_use]
    pub const fn new(default_preview_length: u32) -> Self {
        Self {
            sections: Vec::new(),
            default_preview_length,
        }
    }

    /// # Errors
    /// Returns an error on the first section that fails validation.
    pub fn from_sections(
        sections: impl IntoIterator<Item = Section>,
        default_preview_length: u32,
    ) -> Result<Self, CatalogError> {
        let mut catalog = Self::new(default_preview_length);
        for section in sections {
            catalog.insert(section)?;
        }
        Ok(catalog)
    }

    /// Read a JSON array of sections.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, is not valid JSON, or
    /// holds an invalid section.
    pub fn load(path: &Path, default_preview_length: u32) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog at {}", path.display()))?;
        let sections: Vec<Section> = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse catalog at {}", path.display()))?;
        Self::from_sections(sections, default_preview_length)
            .with_context(|| format!("Invalid catalog at {}", path.display()))
    }

    /// Insert keeping ascending position; ties keep insertion order.
    ///
    /// # Errors
    /// Returns an error if the section is invalid or its permalink is taken.
    pub fn insert(&mut self, mut section: Section) -> Result<(), CatalogError> {
        section.validate()?;
        if self.find(&section.permalink).is_some() {
            return Err(CatalogError::DuplicatePermalink(section.permalink));
        }
        section.pages.sort_by_key(|page| page.position);

        let index = self
            .sections
            .partition_point(|existing| existing.position <= section.position);
        self.sections.insert(index, section);
        Ok(())
    }

    #[must_use]
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    #[must_use]
    pub fn find(&self, permalink: &str) -> Option<&Section> {
        self.sections
            .iter()
            .find(|section| section.permalink == permalink)
    }

    /// Banners of every page, in section order then page order.
    #[must_use]
    pub fn banners(&self) -> Vec<&Banner> {
        self.sections
            .iter()
            .flat_map(|section| section.pages.iter())
            .filter_map(|page| page.banner.as_ref())
            .collect()
    }

    #[must_use]
    pub fn preview_length_or_default(&self, section: &Section) -> u32 {
        section
            .preview_length
            .unwrap_or(self.default_preview_length)
    }

    #[must_use]
    pub const fn default_preview_length(&self) -> u32 {
        self.default_preview_length
    }
}

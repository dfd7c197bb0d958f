use image::RgbaImage;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tracing::{debug, info};

use super::sources::{FallbackSource, open_source};
use crate::{ConfigError, RegistryError, Resolution, SourceReadError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    VideoLoop,
    ImageSequence,
    StaticImage,
    ColorBars,
    TestPattern,
}

impl SourceKind {
    pub fn is_file_backed(self) -> bool {
        matches!(
            self,
            SourceKind::VideoLoop | SourceKind::ImageSequence | SourceKind::StaticImage
        )
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::VideoLoop => write!(f, "video_loop"),
            SourceKind::ImageSequence => write!(f, "image_sequence"),
            SourceKind::StaticImage => write!(f, "static_image"),
            SourceKind::ColorBars => write!(f, "color_bars"),
            SourceKind::TestPattern => write!(f, "test_pattern"),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackSourceDefinition {
    pub name: String,
    pub kind: SourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(rename = "loop", default = "default_true")]
    pub looping: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl FallbackSourceDefinition {
    pub fn new(name: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            path: None,
            looping: true,
            priority: 0,
            enabled: true,
        }
    }

    pub fn color_bars(name: impl Into<String>) -> Self {
        Self::new(name, SourceKind::ColorBars)
    }

    pub fn test_pattern(name: impl Into<String>) -> Self {
        Self::new(name, SourceKind::TestPattern)
    }

    pub fn static_image(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::new(name, SourceKind::StaticImage).with_path(path)
    }

    pub fn image_sequence(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self::new(name, SourceKind::ImageSequence).with_path(dir)
    }

    pub fn video_loop(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::new(name, SourceKind::VideoLoop).with_path(path)
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_loop(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Runtime side of a registered source. The cursor reset requested on
/// activation is applied by the next read, under the source's own lock.
pub(crate) struct SourceSlot {
    source: Mutex<Box<dyn FallbackSource>>,
    reset_pending: AtomicBool,
}

impl SourceSlot {
    fn new(source: Box<dyn FallbackSource>) -> Self {
        Self {
            source: Mutex::new(source),
            reset_pending: AtomicBool::new(false),
        }
    }

    fn request_reset(&self) {
        self.reset_pending.store(true, Ordering::Release);
    }

    /// Returns the frame and the cursor position after the read.
    pub fn read(&self) -> (Result<Arc<RgbaImage>, SourceReadError>, u64) {
        let mut source = self.source.lock();
        if self.reset_pending.swap(false, Ordering::AcqRel) {
            source.reset();
        }
        let frame = source.next_frame();
        (frame, source.position())
    }
}

struct Entry {
    definition: FallbackSourceDefinition,
    name: Arc<str>,
    slot: Arc<SourceSlot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSummary {
    pub name: String,
    pub kind: SourceKind,
    pub priority: i32,
    pub enabled: bool,
    pub active: bool,
}

/// Registered fallback sources in registration order, plus the single active one.
pub struct SourceRegistry {
    entries: Vec<Entry>,
    active: Option<Arc<str>>,
    frame_size: Resolution,
}

impl SourceRegistry {
    pub fn new(frame_size: Resolution) -> Self {
        Self {
            entries: vec![],
            active: None,
            frame_size,
        }
    }

    pub fn frame_size(&self) -> Resolution {
        self.frame_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Validates the definition and opens its backing resource.
    pub fn register(&mut self, definition: FallbackSourceDefinition) -> Result<(), RegistryError> {
        self.check_name(&definition.name)?;
        let source = open_source(&definition, self.frame_size)?;
        self.insert(definition, source);
        Ok(())
    }

    /// Registers a caller-provided producer under the given definition. The
    /// definition's path is not checked.
    pub fn register_with(
        &mut self,
        definition: FallbackSourceDefinition,
        source: Box<dyn FallbackSource>,
    ) -> Result<(), RegistryError> {
        self.check_name(&definition.name)?;
        self.insert(definition, source);
        Ok(())
    }

    pub(crate) fn check_name(&self, name: &str) -> Result<(), RegistryError> {
        if name.trim().is_empty() {
            return Err(ConfigError::invalid("name", "source name must not be empty").into());
        }
        if self.position(name).is_some() {
            return Err(RegistryError::DuplicateName(name.to_string()));
        }
        Ok(())
    }

    fn insert(&mut self, definition: FallbackSourceDefinition, source: Box<dyn FallbackSource>) {
        info!(
            "Registered {} source '{}' (priority {}, {})",
            definition.kind,
            definition.name,
            definition.priority,
            if definition.enabled { "enabled" } else { "disabled" }
        );

        self.entries.push(Entry {
            name: Arc::from(definition.name.as_str()),
            definition,
            slot: Arc::new(SourceSlot::new(source)),
        });
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.definition.name == name)
    }

    fn entry(&self, name: &str) -> Result<&Entry, RegistryError> {
        self.entries
            .iter()
            .find(|e| e.definition.name == name)
            .ok_or_else(|| RegistryError::UnknownSource(name.to_string()))
    }

    fn other_enabled_exists(&self, name: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.definition.enabled && e.definition.name != name)
    }

    /// Removes a source. The active source can only be removed while another
    /// enabled source exists. Returns whether the removed source was active.
    pub fn remove(&mut self, name: &str) -> Result<bool, RegistryError> {
        let index = self
            .position(name)
            .ok_or_else(|| RegistryError::UnknownSource(name.to_string()))?;

        let was_active = self.active_name() == Some(name);
        if was_active {
            if !self.other_enabled_exists(name) {
                return Err(RegistryError::LastEnabledSource(name.to_string()));
            }
            self.active = None;
        }

        self.entries.remove(index);
        info!("Removed source '{}'", name);
        Ok(was_active)
    }

    /// Returns whether the source was active and got deactivated.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<bool, RegistryError> {
        let index = self
            .position(name)
            .ok_or_else(|| RegistryError::UnknownSource(name.to_string()))?;

        let was_active = self.active_name() == Some(name);
        if !enabled && was_active && !self.other_enabled_exists(name) {
            return Err(RegistryError::LastEnabledSource(name.to_string()));
        }

        self.entries[index].definition.enabled = enabled;
        debug!("Source '{}' enabled = {}", name, enabled);

        if !enabled && was_active {
            self.active = None;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn get(&self, name: &str) -> Option<&FallbackSourceDefinition> {
        self.entries
            .iter()
            .map(|e| &e.definition)
            .find(|d| d.name == name)
    }

    pub fn definitions(&self) -> impl Iterator<Item = &FallbackSourceDefinition> {
        self.entries.iter().map(|e| &e.definition)
    }

    pub fn summaries(&self) -> Vec<SourceSummary> {
        self.entries
            .iter()
            .map(|e| SourceSummary {
                name: e.definition.name.clone(),
                kind: e.definition.kind,
                priority: e.definition.priority,
                enabled: e.definition.enabled,
                active: self.active.as_deref() == Some(e.definition.name.as_str()),
            })
            .collect()
    }

    /// Enabled sources, highest priority first; ties keep registration order.
    pub fn by_priority(&self) -> Vec<&FallbackSourceDefinition> {
        let mut enabled: Vec<_> = self
            .entries
            .iter()
            .map(|e| &e.definition)
            .filter(|d| d.enabled)
            .collect();
        enabled.sort_by(|a, b| b.priority.cmp(&a.priority));
        enabled
    }

    /// The configured default when it is registered and enabled, otherwise
    /// the highest-priority enabled source.
    pub fn preferred(&self, default: Option<&str>) -> Option<String> {
        if let Some(default) = default
            && self.get(default).is_some_and(|d| d.enabled)
        {
            return Some(default.to_string());
        }

        self.by_priority().first().map(|d| d.name.clone())
    }

    /// The enabled source following `after` in priority order, wrapping to
    /// the first. Starts from the first when `after` is unknown or disabled.
    pub fn next_in_rotation(&self, after: Option<&str>) -> Option<String> {
        let ordered = self.by_priority();
        let next = after
            .and_then(|after| ordered.iter().position(|d| d.name == after))
            .map(|i| (i + 1) % ordered.len())
            .unwrap_or(0);

        ordered.get(next).map(|d| d.name.clone())
    }

    /// Makes `name` the active source. A source that was not already active
    /// has its cursor reset. Returns whether the active source changed.
    pub fn activate(&mut self, name: &str) -> Result<bool, RegistryError> {
        let entry = self.entry(name)?;
        if !entry.definition.enabled {
            return Err(RegistryError::SourceDisabled(name.to_string()));
        }
        if self.active.as_deref() == Some(name) {
            return Ok(false);
        }

        entry.slot.request_reset();
        let name = entry.name.clone();
        self.active = Some(name);
        Ok(true)
    }

    /// Like [`activate`](Self::activate), but always resets the cursor.
    pub fn switch_to(&mut self, name: &str) -> Result<bool, RegistryError> {
        let changed = self.activate(name)?;
        if !changed {
            self.entry(name)?.slot.request_reset();
        }
        Ok(changed)
    }

    pub fn deactivate(&mut self) -> Option<Arc<str>> {
        self.active.take()
    }

    pub fn active_name(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub(crate) fn active_slot(&self) -> Option<(Arc<str>, Arc<SourceSlot>)> {
        let active = self.active.as_deref()?;
        let entry = self.entry(active).ok()?;
        Some((entry.name.clone(), entry.slot.clone()))
    }
}

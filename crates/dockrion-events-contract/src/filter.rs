//! Emit policy: which event kinds a run is allowed to stream.
//!
//! Mandatory events (started, complete, error, cancelled) always pass.
//! Everything else is allow-listed, either through a preset or an explicit
//! list. Custom events have their own mode: none, all, or an explicit set
//! of names.

use crate::event::EventKind;
use std::collections::BTreeSet;
use thiserror::Error;

/// Built-in configurable event names (everything non-mandatory and non-custom).
pub const CONFIGURABLE_EVENTS: [&str; 5] = ["token", "step", "progress", "checkpoint", "heartbeat"];

/// Which custom events pass the filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CustomEvents {
    /// No custom events pass.
    None,
    /// Every custom event passes.
    All,
    /// Only the named custom events pass.
    Explicit(BTreeSet<String>),
}

/// Filter configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("unknown events preset: '{0}' (valid: all, chat, debug, minimal)")]
    UnknownPreset(String),
    #[error("unknown event type: '{0}'")]
    UnknownEventType(String),
    #[error("custom event name cannot be empty in 'custom:'")]
    EmptyCustomName,
}

/// Declarative emit policy for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventsFilter {
    allowed: BTreeSet<String>,
    custom: CustomEvents,
}

impl Default for EventsFilter {
    fn default() -> Self {
        Self::all()
    }
}

impl EventsFilter {
    /// Everything allowed (the default when no policy is configured).
    pub fn all() -> Self {
        Self {
            allowed: CONFIGURABLE_EVENTS.iter().map(|s| s.to_string()).collect(),
            custom: CustomEvents::All,
        }
    }

    /// Mandatory events only.
    pub fn minimal() -> Self {
        Self {
            allowed: BTreeSet::new(),
            custom: CustomEvents::None,
        }
    }

    /// Resolve a named preset.
    pub fn preset(name: &str) -> Result<Self, FilterError> {
        match name {
            "minimal" => Ok(Self::minimal()),
            "chat" => Ok(Self {
                allowed: ["token", "step", "heartbeat"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                custom: CustomEvents::None,
            }),
            "debug" | "all" => Ok(Self::all()),
            other => Err(FilterError::UnknownPreset(other.to_string())),
        }
    }

    /// Build from an explicit list of entries.
    ///
    /// Accepts configurable names, mandatory names (no-ops, they are always
    /// allowed), the `custom` wildcard, and `custom:<name>` entries.
    pub fn from_list<I, S>(entries: I) -> Result<Self, FilterError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut allowed = BTreeSet::new();
        let mut custom = CustomEvents::Explicit(BTreeSet::new());
        for entry in entries {
            let entry = entry.as_ref();
            if entry == "custom" {
                custom = CustomEvents::All;
            } else if let Some(name) = entry.strip_prefix("custom:") {
                if name.is_empty() {
                    return Err(FilterError::EmptyCustomName);
                }
                if let CustomEvents::Explicit(names) = &mut custom {
                    names.insert(name.to_string());
                }
            } else if CONFIGURABLE_EVENTS.contains(&entry) {
                allowed.insert(entry.to_string());
            } else if matches!(
                EventKind::parse(entry),
                Some(kind) if kind.is_mandatory()
            ) {
                // Mandatory events are always allowed; listing them is a no-op.
            } else {
                return Err(FilterError::UnknownEventType(entry.to_string()));
            }
        }
        if custom == CustomEvents::Explicit(BTreeSet::new()) {
            custom = CustomEvents::None;
        }
        Ok(Self { allowed, custom })
    }

    /// Replace the custom-event mode, keeping the builtin allow-set.
    pub fn with_custom(mut self, custom: CustomEvents) -> Self {
        self.custom = custom;
        self
    }

    /// Decide whether an event of this kind may be emitted.
    pub fn is_allowed(&self, kind: &EventKind) -> bool {
        if kind.is_mandatory() {
            return true;
        }
        match kind {
            EventKind::Custom(name) => match &self.custom {
                CustomEvents::None => false,
                CustomEvents::All => true,
                CustomEvents::Explicit(names) => names.contains(name),
            },
            other => self.allowed.contains(other.as_str().as_ref()),
        }
    }

    pub fn allows_custom(&self, name: &str) -> bool {
        self.is_allowed(&EventKind::Custom(name.to_string()))
    }

    pub fn custom_events(&self) -> &CustomEvents {
        &self.custom
    }

    /// The effective allow-set, including mandatory events.
    ///
    /// Custom events are reported as `custom` (wildcard) or `custom:<name>`
    /// entries.
    pub fn allowed_kinds(&self) -> BTreeSet<String> {
        let mut out: BTreeSet<String> = ["started", "complete", "error", "cancelled"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        out.extend(self.allowed.iter().cloned());
        match &self.custom {
            CustomEvents::None => {}
            CustomEvents::All => {
                out.insert("custom".to_string());
            }
            CustomEvents::Explicit(names) => {
                out.extend(names.iter().map(|n| format!("custom:{n}")));
            }
        }
        out
    }
}

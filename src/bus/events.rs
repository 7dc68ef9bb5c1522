//! Event types carried on the bus

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::connection::ConnectionState;
use crate::model::AppConfig;
use crate::surface::InputId;

/// Global keyboard shortcuts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hotkey {
    /// Target (or cancel targeting of) a weight input
    ScaleTarget,
    /// Toggle the barcode scanner
    ScannerToggle,
}

/// Input-surface events, the port of the page's DOM listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UiEvent {
    Focus { input: InputId },
    Blur { input: InputId },
    /// Manual typing on an input
    Keystroke { input: InputId },
    Paste { input: InputId },
    Hotkey { hotkey: Hotkey },
    /// A stock operation reported success somewhere on the page
    SuccessToast,
    /// A form was reset; `None` resets every form
    FormReset { form: Option<String> },
}

impl UiEvent {
    /// Input the event concerns, if any
    pub fn input(&self) -> Option<&InputId> {
        match self {
            Self::Focus { input }
            | Self::Blur { input }
            | Self::Keystroke { input }
            | Self::Paste { input } => Some(input),
            Self::Hotkey { .. } | Self::SuccessToast | Self::FormReset { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// All events that can be published on the event bus.
///
/// Events are organized into categories:
/// - Configuration: saved settings, explicit clear-input requests
/// - UI: focus, typing, hotkeys and page signals from the input surface
/// - Hub: connection lifecycle and state mirror
/// - Modules: enable/disable and applied readings
/// - System: user notifications, shutdown
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[allow(clippy::large_enum_variant)]
pub enum BusEvent {
    // =========================================================================
    // Configuration Events
    // =========================================================================
    /// The settings form was saved with a new configuration
    ConfigSaved { config: AppConfig },

    /// User asked to clear an input and await the next reading for it
    ClearInput {
        /// Module that owns the button (e.g. "scale")
        module: String,
        input: InputId,
    },

    // =========================================================================
    // UI Events
    // =========================================================================
    Ui(UiEvent),

    // =========================================================================
    // Hub Events
    // =========================================================================
    /// Connection is ready; modules should (re)subscribe
    HubConnected,

    HubDisconnected { reason: Option<String> },

    ConnectionStateChanged { state: ConnectionState },

    // =========================================================================
    // Module Events
    // =========================================================================
    ModuleEnabled { module: String },

    ModuleDisabled { module: String },

    /// A module wrote a reading into an input
    ValueWritten {
        module: String,
        input: InputId,
        value: String,
    },

    // =========================================================================
    // System Events
    // =========================================================================
    /// Short user-facing message
    Notification {
        level: NotificationLevel,
        message: String,
    },

    ShuttingDown { reason: Option<String> },
}

impl BusEvent {
    /// Get the event type as a string (for logging/filtering)
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ConfigSaved { .. } => "config_saved",
            Self::ClearInput { .. } => "clear_input",
            Self::Ui(_) => "ui",
            Self::HubConnected => "hub_connected",
            Self::HubDisconnected { .. } => "hub_disconnected",
            Self::ConnectionStateChanged { .. } => "connection_state_changed",
            Self::ModuleEnabled { .. } => "module_enabled",
            Self::ModuleDisabled { .. } => "module_disabled",
            Self::ValueWritten { .. } => "value_written",
            Self::Notification { .. } => "notification",
            Self::ShuttingDown { .. } => "shutting_down",
        }
    }

    pub fn is_hub_event(&self) -> bool {
        matches!(
            self,
            Self::HubConnected | Self::HubDisconnected { .. } | Self::ConnectionStateChanged { .. }
        )
    }

    pub fn notify(level: NotificationLevel, message: impl Into<String>) -> Self {
        Self::Notification {
            level,
            message: message.into(),
        }
    }
}

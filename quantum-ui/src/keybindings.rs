use std::collections::HashMap;

/// A built-in keyboard shortcut bound to a command id.
pub struct BuiltinKeybinding {
    pub id: &'static str,
    pub description: &'static str,
    pub category: &'static str,
    pub default_accel: &'static str,
}

pub const BUILTIN_KEYBINDINGS: &[BuiltinKeybinding] = &[
    // File
    BuiltinKeybinding {
        id: "file.new",
        description: "New File",
        category: "File",
        default_accel: "<Ctrl>n",
    },
    BuiltinKeybinding {
        id: "file.save",
        description: "Save",
        category: "File",
        default_accel: "<Ctrl>s",
    },
    // View
    BuiltinKeybinding {
        id: "view.toggleTerminal",
        description: "Toggle Terminal",
        category: "View",
        default_accel: "<Ctrl>grave",
    },
    BuiltinKeybinding {
        id: "view.showSearch",
        description: "Find in Files",
        category: "View",
        default_accel: "<Ctrl><Shift>f",
    },
    // Git
    BuiltinKeybinding {
        id: "git.commit",
        description: "Commit",
        category: "Git",
        default_accel: "<Ctrl><Shift>g",
    },
    // Edit
    BuiltinKeybinding {
        id: "edit.format",
        description: "Format Document",
        category: "Edit",
        default_accel: "<Shift><Alt>f",
    },
    // Palette
    BuiltinKeybinding {
        id: "palette.show",
        description: "Show Command Palette",
        category: "Palette",
        default_accel: "<Ctrl>p",
    },
];

/// Returns the accel string for a keybinding id, using the override if present,
/// otherwise the built-in default.
pub fn get_accel(id: &str, overrides: &HashMap<String, String>) -> String {
    if let Some(display_str) = overrides.get(id) {
        let accel = parse_keybinding_to_accel(display_str);
        if !accel.is_empty() {
            return accel;
        }
        log::warn!("Ignoring unparseable keybinding '{}' for {}", display_str, id);
    }
    BUILTIN_KEYBINDINGS
        .iter()
        .find(|kb| kb.id == id)
        .map(|kb| kb.default_accel.to_string())
        .unwrap_or_default()
}

/// Converts an accel string like `"<Ctrl><Shift>f"` to `"Ctrl+Shift+F"`.
pub fn accel_to_display(accel: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut remaining = accel;

    while remaining.starts_with('<') {
        let Some(end) = remaining.find('>') else {
            break;
        };
        let modifier = &remaining[1..end];
        parts.push(
            match modifier.to_lowercase().as_str() {
                "ctrl" | "control" => "Ctrl",
                "shift" => "Shift",
                "alt" => "Alt",
                "super" | "meta" => "Super",
                _ => modifier,
            }
            .to_string(),
        );
        remaining = &remaining[end + 1..];
    }

    if !remaining.is_empty() {
        let key = match remaining {
            "grave" => "`".to_string(),
            "comma" => ",".to_string(),
            "period" => ".".to_string(),
            "equal" => "=".to_string(),
            "minus" => "-".to_string(),
            single if single.chars().count() == 1 => single.to_uppercase(),
            other => other.to_string(),
        };
        parts.push(key);
    }

    parts.join("+")
}

/// Converts `"Ctrl+Shift+F"` into `"<Ctrl><Shift>f"`. Returns an empty string
/// if a modifier is not recognised.
pub fn parse_keybinding_to_accel(key: &str) -> String {
    let parts: Vec<&str> = key.split('+').map(str::trim).collect();
    let Some((last, modifiers)) = parts.split_last() else {
        return String::new();
    };
    if last.is_empty() {
        return String::new();
    }
    let mut accel = String::new();
    for part in modifiers {
        match part.to_lowercase().as_str() {
            "ctrl" | "control" => accel.push_str("<Ctrl>"),
            "shift" => accel.push_str("<Shift>"),
            "alt" => accel.push_str("<Alt>"),
            "super" | "meta" | "cmd" => accel.push_str("<Super>"),
            _ => return String::new(),
        }
    }
    let key_name = match *last {
        "`" => "grave".to_string(),
        "," => "comma".to_string(),
        "." => "period".to_string(),
        "=" => "equal".to_string(),
        "-" => "minus".to_string(),
        other if other.chars().count() == 1 => other.to_lowercase(),
        other => other.to_string(),
    };
    accel.push_str(&key_name);
    accel
}

/// Parsed representation of an accelerator for matching key presses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct KeyChord {
    pub ctrl: bool,
    pub shift: bool,
    pub alt: bool,
    pub super_: bool,
    /// Lowercase key name (e.g. "p", "grave", "f11").
    pub key_lower: String,
}

impl KeyChord {
    /// A pressed key. Single characters are normalised to their accel names.
    pub fn pressed(key: &str, ctrl: bool, shift: bool, alt: bool) -> Self {
        let key_lower = match key {
            "`" => "grave".to_string(),
            "," => "comma".to_string(),
            other => other.to_lowercase(),
        };
        KeyChord {
            ctrl,
            shift,
            alt,
            super_: false,
            key_lower,
        }
    }
}

/// Parse an accel string like `"<Ctrl><Shift>g"` into a [`KeyChord`].
pub fn parse_accel(accel: &str) -> Option<KeyChord> {
    let mut chord = KeyChord::default();
    let mut remaining = accel;

    while remaining.starts_with('<') {
        let Some(end) = remaining.find('>') else {
            break;
        };
        match remaining[1..end].to_lowercase().as_str() {
            "ctrl" | "control" => chord.ctrl = true,
            "shift" => chord.shift = true,
            "alt" => chord.alt = true,
            "super" => chord.super_ = true,
            _ => {}
        }
        remaining = &remaining[end + 1..];
    }

    if remaining.is_empty() {
        return None;
    }
    chord.key_lower = remaining.to_lowercase();
    Some(chord)
}

/// Resolved chord table: accelerator → command id.
#[derive(Debug, Clone, Default)]
pub struct Keymap {
    bindings: Vec<(KeyChord, String)>,
}

impl Keymap {
    /// Resolve every built-in binding, applying `overrides` (command id → display string).
    pub fn resolve(overrides: &HashMap<String, String>) -> Self {
        let bindings = BUILTIN_KEYBINDINGS
            .iter()
            .filter_map(|kb| {
                let accel = get_accel(kb.id, overrides);
                parse_accel(&accel).map(|chord| (chord, kb.id.to_string()))
            })
            .collect();
        Keymap { bindings }
    }

    pub fn command_for(&self, chord: &KeyChord) -> Option<&str> {
        self.bindings
            .iter()
            .find(|(c, _)| c == chord)
            .map(|(_, id)| id.as_str())
    }

    /// Display string for a command's chord, for palette labels.
    pub fn display_for(&self, id: &str) -> Option<String> {
        self.bindings.iter().find(|(_, cid)| cid == id).map(|(c, _)| {
            let mut accel = String::new();
            if c.ctrl {
                accel.push_str("<Ctrl>");
            }
            if c.shift {
                accel.push_str("<Shift>");
            }
            if c.alt {
                accel.push_str("<Alt>");
            }
            if c.super_ {
                accel.push_str("<Super>");
            }
            accel.push_str(&c.key_lower);
            accel_to_display(&accel)
        })
    }
}

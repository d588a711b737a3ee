//! Named keys and signals that scenarios can send to a program

use serde::{Deserialize, Deserializer};
use std::fmt;
use std::str::FromStr;

use crate::common::Error;

/// A named key, mapped to the byte sequence a terminal would send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Enter,
    Up,
    Down,
    Right,
    Left,
    PageUp,
    PageDown,
    Home,
    End,
    Space,
    Escape,
}

impl Key {
    pub const ALL: [Key; 11] = [
        Key::Enter,
        Key::Up,
        Key::Down,
        Key::Right,
        Key::Left,
        Key::PageUp,
        Key::PageDown,
        Key::Home,
        Key::End,
        Key::Space,
        Key::Escape,
    ];

    /// Bytes written to the program's input for this key
    pub fn bytes(&self) -> &'static [u8] {
        match self {
            Key::Enter => b"\n",
            Key::Up => b"\x1b[A",
            Key::Down => b"\x1b[B",
            Key::Right => b"\x1b[C",
            Key::Left => b"\x1b[D",
            Key::PageUp => b"\x1b[5~",
            Key::PageDown => b"\x1b[6~",
            Key::Home => b"\x1b[H",
            Key::End => b"\x1b[F",
            Key::Space => b" ",
            Key::Escape => b"\x1b",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Key::Enter => "enter",
            Key::Up => "up",
            Key::Down => "down",
            Key::Right => "right",
            Key::Left => "left",
            Key::PageUp => "page_up",
            Key::PageDown => "page_down",
            Key::Home => "home",
            Key::End => "end",
            Key::Space => "space",
            Key::Escape => "escape",
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Key {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        let alias = match normalized.as_str() {
            "return" => "enter",
            "esc" => "escape",
            "pgup" | "pageup" => "page_up",
            "pgdn" | "pagedown" => "page_down",
            other => other,
        };
        Key::ALL
            .iter()
            .copied()
            .find(|k| k.name() == alias)
            .ok_or_else(|| Error::Config(format!("unknown key '{}'", s)))
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Signals a scenario can deliver to the running program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGINT, what Ctrl-C delivers
    Interrupt,
    /// SIGTERM
    Terminate,
    /// SIGKILL
    Kill,
}

impl FromStr for Signal {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        match normalized.strip_prefix("sig").unwrap_or(&normalized) {
            "int" | "interrupt" => Ok(Signal::Interrupt),
            "term" | "terminate" => Ok(Signal::Terminate),
            "kill" => Ok(Signal::Kill),
            _ => Err(Error::Config(format!("unknown signal '{}'", s))),
        }
    }
}

impl<'de> Deserialize<'de> for Signal {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Signal {
    pub fn number(&self) -> i32 {
        match self {
            Signal::Interrupt => 2,
            Signal::Terminate => 15,
            Signal::Kill => 9,
        }
    }

    /// Exit code reported for a program terminated by this signal
    pub fn exit_code(&self) -> i32 {
        128 + self.number()
    }
}

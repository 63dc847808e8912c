//! Slot addressing and normalization of the physical attributes reported for a slot.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::KeeperError;

/// Number of filament boxes attached to the printer.
pub const UNITS: u8 = 4;
/// Position letters inside one box.
pub const POSITIONS: [char; 4] = ['A', 'B', 'C', 'D'];

/// Stable slot address: box index (1-based) and position letter, written as `"2B"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SlotKey {
    unit: u8,
    position: char,
}

impl SlotKey {
    pub fn new(unit: u8, position: char) -> Result<Self, KeeperError> {
        let position = position.to_ascii_uppercase();
        if !(1..=UNITS).contains(&unit) || !POSITIONS.contains(&position) {
            return Err(KeeperError::UnknownSlot(format!("{}{}", unit, position)));
        }
        Ok(Self { unit, position })
    }

    pub fn unit(&self) -> u8 {
        self.unit
    }

    pub fn position(&self) -> char {
        self.position
    }

    /// Zero-based index of the position letter inside its box.
    pub fn position_index(&self) -> usize {
        POSITIONS
            .iter()
            .position(|p| *p == self.position)
            .unwrap_or_default()
    }

    /// All slots of the changer in address order (`1A`, `1B`, ... `4D`).
    pub fn all() -> impl Iterator<Item = SlotKey> {
        (1..=UNITS).flat_map(|unit| POSITIONS.iter().map(move |&position| SlotKey { unit, position }))
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.unit, self.position)
    }
}

impl FromStr for SlotKey {
    type Err = KeeperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let mut chars = trimmed.chars();
        match (chars.next(), chars.next(), chars.next()) {
            (Some(digit), Some(letter), None) => {
                let unit = digit
                    .to_digit(10)
                    .ok_or_else(|| KeeperError::UnknownSlot(trimmed.to_string()))?;
                SlotKey::new(unit as u8, letter)
            }
            _ => Err(KeeperError::UnknownSlot(trimmed.to_string())),
        }
    }
}

impl TryFrom<String> for SlotKey {
    type Error = KeeperError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SlotKey> for String {
    fn from(key: SlotKey) -> Self {
        key.to_string()
    }
}

/// Material name used when the device or a legacy file reports nothing usable.
pub const FALLBACK_MATERIAL: &str = "OTHER";

/// Normalize a material label: trimmed, upper case, placeholders mapped to `OTHER`.
pub fn normalize_material(raw: &str) -> String {
    let upper = raw.trim().to_uppercase();
    match upper.as_str() {
        "" | "-" | "—" | "–" | "N/A" | "NA" | "NONE" | "-1" => FALLBACK_MATERIAL.to_string(),
        _ => upper,
    }
}

/// Normalize a colour value to `#rrggbb`.
///
/// Accepts `#RRGGBB`, bare hex, and the 7-digit Creality form (`0ffa800`) where
/// the last six digits carry the colour.
pub fn normalize_color(raw: &str) -> Option<String> {
    let v = raw.trim().trim_start_matches('#').to_lowercase();
    if v.len() < 6 || !v.is_ascii() {
        return None;
    }
    let hex6 = &v[v.len() - 6..];
    if hex6.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(format!("#{}", hex6))
    } else {
        None
    }
}

/// Euclidean RGB distance between two `#rrggbb` colours; unparseable input sorts last.
pub fn color_distance(a: &str, b: &str) -> f64 {
    fn rgb(hex: &str) -> Option<(i32, i32, i32)> {
        let h = hex.trim_start_matches('#');
        if h.len() != 6 || !h.is_ascii() {
            return None;
        }
        let r = i32::from_str_radix(&h[0..2], 16).ok()?;
        let g = i32::from_str_radix(&h[2..4], 16).ok()?;
        let b = i32::from_str_radix(&h[4..6], 16).ok()?;
        Some((r, g, b))
    }
    match (rgb(a), rgb(b)) {
        (Some((r1, g1, b1)), Some((r2, g2, b2))) => {
            (((r1 - r2).pow(2) + (g1 - g2).pow(2) + (b1 - b2).pow(2)) as f64).sqrt()
        }
        _ => 999.0,
    }
}

use colored::Color;

pub const PRIMARY: Color = Color::BrightGreen;
pub const ACCENT: Color = Color::BrightYellow;
pub const SEPARATOR: Color = Color::BrightBlack;
pub const TEXT_DEFAULT: Color = Color::White;
pub const MAC_ADDR: Color = Color::BrightCyan;
pub const IPV4_ADDR: Color = Color::BrightBlue;

pub const SUCCEEDED: Color = Color::Green;
pub const FAILED: Color = Color::Red;
pub const SKIPPED: Color = Color::Yellow;

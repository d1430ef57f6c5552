//! Shared UI icons and emojis.
//!
//! Emoji constants used across the terminal UI, with plain-text fallbacks
//! for terminals without emoji support.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");

// Workflow indicators
pub static PROBE: Emoji<'_, '_> = Emoji("📡 ", "[PROBE]");
pub static PEN: Emoji<'_, '_> = Emoji("✍️  ", "[WRITE]");
pub static REVIEW: Emoji<'_, '_> = Emoji("🔍 ", "[REVIEW]");
pub static ARTIFACT: Emoji<'_, '_> = Emoji("📄 ", "[FILE]");
pub static QUESTION: Emoji<'_, '_> = Emoji("❓ ", "[?]");

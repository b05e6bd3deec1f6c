//! Shared UI icons.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[WARN]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");

// Run indicators
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static JOIN: Emoji<'_, '_> = Emoji("🔀 ", "[J]");
pub static SNAPSHOT: Emoji<'_, '_> = Emoji("📸 ", "[S]");
pub static REVIEW: Emoji<'_, '_> = Emoji("🔍 ", "[R]");
pub static REPAIR: Emoji<'_, '_> = Emoji("🔧 ", "[FIX]");
pub static CLOCK: Emoji<'_, '_> = Emoji("⏱️  ", "[T]");

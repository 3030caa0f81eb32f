pub mod backfill;
pub mod context;
pub mod curate;
pub mod search;
pub mod seed;
pub mod sessions;
pub mod stats;

use indicatif::{ProgressBar, ProgressStyle};

/// Bounded progress bar in the house style.
fn progress_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  {bar:40.cyan/blue} {pos}/{len} ({eta})")
            .expect("valid template")
            .progress_chars("##-"),
    );
    pb
}

/// At most `max` chars of `content`, ending in "..." when cut.
fn preview(content: &str, max: usize) -> String {
    if content.chars().count() > max {
        let kept: String = content.chars().take(max.saturating_sub(3)).collect();
        format!("{kept}...")
    } else {
        content.to_string()
    }
}

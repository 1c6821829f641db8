//! Display projection of the view count.
//!
//! Turns the raw authoritative count into what the page shows: a
//! pluralized, digit-grouped label that eases from the previous value to the
//! new one. Everything here is cosmetic and runs on its own task and clock,
//! so it can never hold up counting.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Text shown while the count is not known yet.
pub const LOADING_TEXT: &str = "Loading...";

/// What the counter widget renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterView {
    /// Label to show, e.g. `"1,234 views"`.
    pub display_text: String,
    /// Authoritative count, `None` while loading.
    pub raw_count: Option<u64>,
}

impl CounterView {
    /// The view before any count is known.
    #[must_use]
    pub fn loading() -> Self {
        Self {
            display_text: LOADING_TEXT.to_string(),
            raw_count: None,
        }
    }

    /// A view showing `displayed` (possibly mid-animation) for the raw count `raw`.
    #[must_use]
    pub fn showing(displayed: u64, raw: u64) -> Self {
        Self {
            display_text: format_views(displayed),
            raw_count: Some(raw),
        }
    }

    /// Whether the count is still loading.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.raw_count.is_none()
    }
}

impl Default for CounterView {
    fn default() -> Self {
        Self::loading()
    }
}

/// Styling hint passed down from the page shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StyleHint {
    /// Whether the page is in dark mode.
    pub is_dark: bool,
}

/// Colour tokens for the counter badge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Palette {
    /// Eye icon colour.
    pub icon: &'static str,
    /// Label colour.
    pub text: &'static str,
    /// Badge background.
    pub background: &'static str,
    /// Badge border.
    pub border: &'static str,
}

impl StyleHint {
    /// Pick the badge colours for this hint.
    #[must_use]
    pub fn palette(self) -> Palette {
        if self.is_dark {
            Palette {
                icon: "purple-400",
                text: "purple-300",
                background: "purple-900/30",
                border: "purple-700/30",
            }
        } else {
            Palette {
                icon: "purple-600",
                text: "purple-600",
                background: "white/80",
                border: "purple-200/50",
            }
        }
    }
}

/// Format a count as a label: `"1 view"`, `"12,345 views"`.
#[must_use]
pub fn format_views(count: u64) -> String {
    let unit = if count == 1 { "view" } else { "views" };
    format!("{} {unit}", group_digits(count))
}

/// Insert thousands separators.
#[must_use]
pub fn group_digits(value: u64) -> String {
    let digits = value.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    grouped
}

/// Ease-out-quart: fast start, gentle landing. `progress` is clamped to `0..=1`.
#[must_use]
pub fn ease_out_quart(progress: f64) -> f64 {
    let p = progress.clamp(0.0, 1.0);
    1.0 - (1.0 - p).powi(4)
}

/// Value shown at `progress` of an animation from `start` to `end`.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn interpolate(start: u64, end: u64, progress: f64) -> u64 {
    if progress >= 1.0 {
        return end;
    }
    let eased = ease_out_quart(progress);
    let value = start as f64 + (end as f64 - start as f64) * eased;
    value.floor().max(0.0) as u64
}

/// Timing of the count animation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectorOptions {
    /// How long one transition takes. Zero jumps straight to the target.
    pub duration: Duration,
    /// Time between frames.
    pub frame_interval: Duration,
}

impl Default for ProjectorOptions {
    fn default() -> Self {
        Self {
            duration: Duration::from_millis(2_000),
            frame_interval: Duration::from_millis(16),
        }
    }
}

/// Spawn the projector: follows `counts` and publishes animated views to `view`.
///
/// The task ends when the sender side of `counts` is dropped.
pub fn spawn_projector(
    counts: watch::Receiver<Option<u64>>,
    view: watch::Sender<CounterView>,
    options: ProjectorOptions,
) -> JoinHandle<()> {
    tokio::spawn(project(counts, view, options))
}

async fn project(
    mut counts: watch::Receiver<Option<u64>>,
    view: watch::Sender<CounterView>,
    options: ProjectorOptions,
) {
    // The first count animates up from zero
    let mut shown = 0;

    loop {
        let target = *counts.borrow_and_update();
        let Some(target) = target else {
            view.send_replace(CounterView::loading());
            if counts.changed().await.is_err() {
                return;
            }
            continue;
        };

        let start = shown;
        let started = Instant::now();
        let mut frames = tokio::time::interval(options.frame_interval.max(Duration::from_millis(1)));
        frames.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let interrupted = loop {
            tokio::select! {
                _ = frames.tick() => {
                    let progress = if options.duration.is_zero() {
                        1.0
                    } else {
                        started.elapsed().as_secs_f64() / options.duration.as_secs_f64()
                    };
                    shown = interpolate(start, target, progress);
                    view.send_replace(CounterView::showing(shown, target));
                    if progress >= 1.0 {
                        break false;
                    }
                }
                changed = counts.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    // Retarget from whatever is on screen right now
                    break true;
                }
            }
        };

        if !interrupted && counts.changed().await.is_err() {
            return;
        }
    }
}

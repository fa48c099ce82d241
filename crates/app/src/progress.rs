use std::sync::LazyLock;

use indicatif::{ProgressBar, ProgressStyle};
use neuronflow_core::InferenceProgress;

static BATCH_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template(
            "[{elapsed_precise}] {msg:>18} [{bar:30.cyan/blue}] {pos}/{len} batches (eta {eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏ ")
});

/// One bar over every batch of every TTA variant of an image.
pub struct BatchProgressBar {
    bar: ProgressBar,
}

impl BatchProgressBar {
    pub fn new(total_batches: usize) -> Self {
        let bar = ProgressBar::new(total_batches as u64);
        bar.set_style(BATCH_STYLE.clone());
        Self { bar }
    }

    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    pub fn update(&self, progress: InferenceProgress) {
        self.bar.set_message(format!(
            "{} {}/{}",
            progress.variant, progress.variant_index, progress.variants
        ));
        self.bar.inc(1);
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

//! Render progress stream

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RenderProgress {
    Idle,
    Rendering { page_index: u32, fraction: f32 },
}

impl RenderProgress {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

/// Single writer of [`RenderProgress`]; readers subscribe
pub(crate) struct ProgressPublisher {
    tx: watch::Sender<RenderProgress>,
}

impl ProgressPublisher {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(RenderProgress::Idle);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<RenderProgress> {
        self.tx.subscribe()
    }

    pub(crate) fn current(&self) -> RenderProgress {
        *self.tx.borrow()
    }

    pub(crate) fn update(&self, page_index: u32, fraction: f32) {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.tx.send_replace(RenderProgress::Rendering {
            page_index,
            fraction,
        });
    }

    pub(crate) fn finish(&self) {
        self.tx.send_replace(RenderProgress::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_and_clamp() {
        let progress = ProgressPublisher::new();
        let rx = progress.subscribe();

        progress.update(3, 1.5);
        assert_eq!(
            *rx.borrow(),
            RenderProgress::Rendering {
                page_index: 3,
                fraction: 1.0
            }
        );

        progress.update(3, f32::NAN);
        assert_eq!(
            progress.current(),
            RenderProgress::Rendering {
                page_index: 3,
                fraction: 0.0
            }
        );

        progress.finish();
        assert!(rx.borrow().is_idle());
    }
}

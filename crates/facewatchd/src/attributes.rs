//! Age/gender stabilization.
//!
//! Per-frame age/gender estimates jitter. A reading that differs from the
//! published snapshot is only published after a short delay, and repeating
//! the reading that is already pending does not restart that delay.

use facewatch_core::{Attributes, FaceDetection, MatchResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Which face feeds the snapshot when several are visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeTarget {
    /// The first face matching the enrollment, else the most prominent face.
    Tracked,
    /// Whichever face the engine returned last.
    Last,
}

impl FromStr for AttributeTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tracked" => Ok(Self::Tracked),
            "last" => Ok(Self::Last),
            other => Err(format!("unknown attribute target {other:?} (tracked|last)")),
        }
    }
}

impl AttributeTarget {
    /// Index into `faces` of the face to observe, if any.
    pub fn select(&self, faces: &[FaceDetection], results: &[MatchResult]) -> Option<usize> {
        match self {
            Self::Last => faces.len().checked_sub(1),
            Self::Tracked => results
                .iter()
                .take(faces.len())
                .position(|r| r.is_match)
                .or_else(|| {
                    faces
                        .iter()
                        .enumerate()
                        .max_by(|(_, a), (_, b)| a.bbox.prominence_cmp(&b.bbox))
                        .map(|(i, _)| i)
                }),
        }
    }
}

/// Sole writer of the attribute snapshot.
pub struct AttributeDebouncer {
    snapshot: Arc<watch::Sender<Option<Attributes>>>,
    delay: Duration,
    pending: Option<(Attributes, JoinHandle<()>)>,
}

impl AttributeDebouncer {
    pub fn new(snapshot: Arc<watch::Sender<Option<Attributes>>>, delay: Duration) -> Self {
        Self {
            snapshot,
            delay,
            pending: None,
        }
    }

    /// Feed one reading. Returns whether a delayed update was scheduled.
    ///
    /// Must be called from within a tokio runtime.
    pub fn observe(&mut self, reading: Attributes) -> bool {
        if *self.snapshot.borrow() == Some(reading) {
            // Back to the published value: a pending change was jitter.
            self.cancel();
            return false;
        }
        if let Some((target, handle)) = &self.pending {
            if *target == reading && !handle.is_finished() {
                return false;
            }
        }

        self.cancel();
        let snapshot = Arc::clone(&self.snapshot);
        let delay = self.delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            snapshot.send_replace(Some(reading));
            tracing::debug!(
                age = reading.age,
                gender = reading.gender.as_str(),
                "attribute snapshot updated"
            );
        });
        self.pending = Some((reading, handle));
        true
    }

    /// Drop the pending update, if any.
    pub fn cancel(&mut self) {
        if let Some((_, handle)) = self.pending.take() {
            handle.abort();
        }
    }
}

impl Drop for AttributeDebouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::face;
    use facewatch_core::Gender;

    const DELAY: Duration = Duration::from_millis(100);

    fn reading(age: f32, gender: Gender) -> Attributes {
        Attributes { age, gender }
    }

    fn debouncer() -> (AttributeDebouncer, watch::Receiver<Option<Attributes>>) {
        let (tx, rx) = watch::channel(None);
        (AttributeDebouncer::new(Arc::new(tx), DELAY), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_waits_for_delay() {
        let (mut d, rx) = debouncer();
        assert!(d.observe(reading(31.0, Gender::Male)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*rx.borrow(), None);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(*rx.borrow(), Some(reading(31.0, Gender::Male)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_readings_do_not_retrigger() {
        let (mut d, mut rx) = debouncer();
        assert!(d.observe(reading(31.0, Gender::Male)));
        tokio::time::sleep(Duration::from_millis(60)).await;
        // Same reading while pending: timer keeps running, not restarted.
        assert!(!d.observe(reading(31.0, Gender::Male)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*rx.borrow_and_update(), Some(reading(31.0, Gender::Male)));

        // Same reading after publication: nothing scheduled, nothing changes.
        assert!(!d.observe(reading(31.0, Gender::Male)));
        tokio::time::sleep(DELAY * 3).await;
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_reading_replaces_pending() {
        let (mut d, rx) = debouncer();
        d.observe(reading(31.0, Gender::Male));
        tokio::time::sleep(Duration::from_millis(40)).await;
        d.observe(reading(29.0, Gender::Female));

        tokio::time::sleep(Duration::from_millis(70)).await;
        // The first update was cancelled; the second is not due yet.
        assert_eq!(*rx.borrow(), None);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(*rx.borrow(), Some(reading(29.0, Gender::Female)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_return_to_published_cancels_pending() {
        let (mut d, rx) = debouncer();
        let a = reading(31.0, Gender::Male);
        let b = reading(55.0, Gender::Female);
        d.observe(a);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*rx.borrow(), Some(a));

        // One jittery B, then A again on the following cycles.
        assert!(d.observe(b));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!d.observe(a));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!d.observe(a));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(*rx.borrow(), Some(a));

        tokio::time::sleep(DELAY * 3).await;
        assert_eq!(*rx.borrow(), Some(a));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_pending() {
        let (mut d, rx) = debouncer();
        d.observe(reading(50.0, Gender::Female));
        drop(d);
        tokio::time::sleep(DELAY * 2).await;
        assert_eq!(*rx.borrow(), None);
    }

    #[test]
    fn test_select_tracked_prefers_match_then_prominence() {
        let faces = vec![face(0.7, 0.0), face(0.95, 1.0), face(0.8, 2.0)];
        let none = vec![MatchResult { is_match: false, distance: 1.0 }; 3];
        assert_eq!(AttributeTarget::Tracked.select(&faces, &none), Some(1));

        let mut third = none.clone();
        third[2] = MatchResult { is_match: true, distance: 0.1 };
        assert_eq!(AttributeTarget::Tracked.select(&faces, &third), Some(2));
    }

    #[test]
    fn test_select_last_and_empty() {
        let faces = vec![face(0.9, 0.0), face(0.6, 1.0)];
        assert_eq!(AttributeTarget::Last.select(&faces, &[]), Some(1));
        assert_eq!(AttributeTarget::Last.select(&[], &[]), None);
        assert_eq!(AttributeTarget::Tracked.select(&[], &[]), None);
    }

    #[test]
    fn test_target_from_str() {
        assert_eq!("Tracked".parse::<AttributeTarget>(), Ok(AttributeTarget::Tracked));
        assert_eq!("last".parse::<AttributeTarget>(), Ok(AttributeTarget::Last));
        assert!("first".parse::<AttributeTarget>().is_err());
    }
}

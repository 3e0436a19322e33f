//! Per-track aggregation of desired simulcast quality
//!
//! Every local subscriber and every federated node reports the highest
//! quality it wants from one video track. The aggregator folds those reports
//! into a single max-subscribed quality that drives the publisher's active
//! layer set.
//!
//! Aggregation starts biased to `High` and holds that bias through a short
//! startup grace period, so the first subscriber sees full quality instead of
//! a spurious drop to `Off` racing its own report.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::info;

use crate::types::{NodeId, ParticipantId, TrackId, VideoQuality};

const INITIAL_QUALITY_UPDATE_WAIT: Duration = Duration::from_secs(10);

pub type OnSubscribedMaxQualityChange = Arc<dyn Fn(VideoQuality) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct QualityAggregatorParams {
    pub track_id: TrackId,
    pub mime_type: String,
}

struct State {
    initialized: bool,
    by_subscriber: HashMap<ParticipantId, VideoQuality>,
    by_node: HashMap<NodeId, VideoQuality>,
    max_subscribed: VideoQuality,
    on_change: Option<OnSubscribedMaxQualityChange>,
}

/// Max subscribed quality for a single video track
pub struct QualityAggregator {
    params: QualityAggregatorParams,
    weak: Weak<Self>,
    state: RwLock<State>,
    grace_timer: Mutex<Option<JoinHandle<()>>>,
}

impl QualityAggregator {
    #[must_use]
    pub fn new(params: QualityAggregatorParams) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            params,
            weak: weak.clone(),
            state: RwLock::new(State {
                initialized: false,
                by_subscriber: HashMap::new(),
                by_node: HashMap::new(),
                max_subscribed: VideoQuality::High,
                on_change: None,
            }),
            grace_timer: Mutex::new(None),
        })
    }

    pub fn on_subscribed_max_quality_change(&self, f: OnSubscribedMaxQualityChange) {
        self.state.write().on_change = Some(f);
    }

    #[must_use]
    pub fn mime_type(&self) -> &str {
        &self.params.mime_type
    }

    #[must_use]
    pub fn max_subscribed_quality(&self) -> VideoQuality {
        self.state.read().max_subscribed
    }

    pub fn start(&self) {
        self.reset();
    }

    pub fn restart(&self) {
        self.reset();
    }

    pub fn stop(&self) {
        self.stop_grace_timer();
    }

    /// A subscriber reported its desired quality; `Off` removes the entry
    pub fn notify_subscriber_max_quality(&self, subscriber_id: ParticipantId, quality: VideoQuality) {
        {
            let mut state = self.state.write();
            if quality.is_off() {
                state.by_subscriber.remove(&subscriber_id);
            } else {
                state.by_subscriber.insert(subscriber_id, quality);
            }
        }
        self.update_quality_change();
    }

    /// A federated node reported its desired quality; `Off` removes the entry
    pub fn notify_subscriber_node_max_quality(&self, node_id: NodeId, quality: VideoQuality) {
        {
            let mut state = self.state.write();
            if quality.is_off() {
                state.by_node.remove(&node_id);
            } else {
                state.by_node.insert(node_id, quality);
            }
        }
        self.update_quality_change();
    }

    fn reset(&self) {
        {
            let mut state = self.state.write();
            state.initialized = false;
            state.max_subscribed = VideoQuality::High;
        }
        self.start_grace_timer();
    }

    fn start_grace_timer(&self) {
        let Some(aggregator) = self.weak.upgrade() else {
            return;
        };

        let mut timer = self.grace_timer.lock();
        if let Some(handle) = timer.take() {
            handle.abort();
        }

        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(INITIAL_QUALITY_UPDATE_WAIT).await;
            aggregator.grace_timer.lock().take();
            aggregator.update_quality_change();
        }));
    }

    fn stop_grace_timer(&self) {
        if let Some(handle) = self.grace_timer.lock().take() {
            handle.abort();
        }
    }

    /// Recompute the aggregate; notify when it moved or on first settling
    fn update_quality_change(&self) {
        let (max_subscribed, on_change) = {
            let mut state = self.state.write();
            let mut max_subscribed = VideoQuality::Off;
            for quality in state.by_subscriber.values().chain(state.by_node.values()) {
                if *quality > max_subscribed {
                    max_subscribed = *quality;
                }
            }

            if max_subscribed == state.max_subscribed && state.initialized {
                return;
            }

            state.initialized = true;
            state.max_subscribed = max_subscribed;
            info!(
                track_id = %self.params.track_id,
                mime = %self.params.mime_type,
                subscribers = state.by_subscriber.len(),
                nodes = state.by_node.len(),
                max_subscribed = %max_subscribed,
                "notifying subscribed quality change"
            );
            (max_subscribed, state.on_change.clone())
        };

        if let Some(f) = on_change {
            f(max_subscribed);
        }
    }
}

//! Four bounded priority lanes drained in strict tier order.

use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, error::SendError, error::TrySendError};

use crate::lifecycle::ShutdownListener;
use crate::model::Priority;

/// Lane capacities in drain order: a quarter of the buffer for Critical,
/// High and Low, half for Normal, never below one.
pub(crate) fn lane_capacities(buffer_size: usize) -> [usize; 4] {
    let quarter = (buffer_size / 4).max(1);
    let half = (buffer_size / 2).max(1);
    [quarter, quarter, half, quarter]
}

pub(crate) fn lanes<T>(buffer_size: usize) -> (LaneSenders<T>, LaneReceivers<T>) {
    let [c, h, n, l] = lane_capacities(buffer_size).map(mpsc::channel);
    (
        LaneSenders {
            lanes: [c.0, h.0, n.0, l.0],
        },
        LaneReceivers {
            lanes: [c.1, h.1, n.1, l.1],
        },
    )
}

#[derive(Debug)]
pub(crate) struct LaneSenders<T> {
    lanes: [mpsc::Sender<T>; 4],
}

impl<T> LaneSenders<T> {
    pub(crate) fn try_send(&self, priority: Priority, item: T) -> Result<(), TrySendError<T>> {
        self.lanes[priority.drain_index()].try_send(item)
    }

    pub(crate) async fn send(&self, priority: Priority, item: T) -> Result<(), SendError<T>> {
        self.lanes[priority.drain_index()].send(item).await
    }

    /// Queued items per lane, in drain order.
    pub(crate) fn pending(&self) -> [usize; 4] {
        let mut pending = [0; 4];
        for (slot, lane) in pending.iter_mut().zip(&self.lanes) {
            *slot = lane.max_capacity() - lane.capacity();
        }
        pending
    }

    pub(crate) fn total_pending(&self) -> usize {
        self.pending().iter().sum()
    }
}

#[derive(Debug)]
pub(crate) struct LaneReceivers<T> {
    lanes: [mpsc::Receiver<T>; 4],
}

impl<T> LaneReceivers<T> {
    /// Highest-tier item available right now.
    pub(crate) fn try_recv(&mut self) -> Option<T> {
        self.lanes.iter_mut().find_map(|lane| lane.try_recv().ok())
    }

    /// Wait for the next item, preferring higher tiers.
    pub(crate) async fn recv(&mut self) -> Option<T> {
        if let Some(item) = self.try_recv() {
            return Some(item);
        }
        let [critical, high, normal, low] = &mut self.lanes;
        tokio::select! {
            biased;
            Some(item) = critical.recv() => Some(item),
            Some(item) = high.recv() => Some(item),
            Some(item) = normal.recv() => Some(item),
            Some(item) = low.recv() => Some(item),
            else => None,
        }
    }
}

/// Next item for a worker sharing `receivers`, or `None` on shutdown.
pub(crate) async fn next_item<T>(
    receivers: &Mutex<LaneReceivers<T>>,
    shutdown: &ShutdownListener,
) -> Option<T> {
    tokio::select! {
        biased;
        () = shutdown.cancelled() => None,
        item = async { receivers.lock().await.recv().await } => item,
    }
}

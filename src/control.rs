//! Narrow read-snapshot control surface (§6). No HTTP framework ships in
//! this crate (axum was dropped, see DESIGN.md) — `ControlHandle` is a
//! cheaply-cloneable struct over `tokio::sync::watch` that a caller's own
//! web layer can poll or subscribe to without ever blocking the engine.

use tokio::sync::watch;

use crate::observability::{PnlSnapshot, PositionsSnapshot, StatusSnapshot};

#[derive(Clone)]
pub struct ControlHandle {
    status_rx: watch::Receiver<StatusSnapshot>,
    positions_rx: watch::Receiver<PositionsSnapshot>,
    pnl_rx: watch::Receiver<PnlSnapshot>,
}

pub struct ControlPublisher {
    status_tx: watch::Sender<StatusSnapshot>,
    positions_tx: watch::Sender<PositionsSnapshot>,
    pnl_tx: watch::Sender<PnlSnapshot>,
}

pub fn channel(
    initial_status: StatusSnapshot,
    initial_positions: PositionsSnapshot,
    initial_pnl: PnlSnapshot,
) -> (ControlPublisher, ControlHandle) {
    let (status_tx, status_rx) = watch::channel(initial_status);
    let (positions_tx, positions_rx) = watch::channel(initial_positions);
    let (pnl_tx, pnl_rx) = watch::channel(initial_pnl);
    (
        ControlPublisher { status_tx, positions_tx, pnl_tx },
        ControlHandle { status_rx, positions_rx, pnl_rx },
    )
}

impl ControlPublisher {
    pub fn publish_status(&self, snapshot: StatusSnapshot) {
        let _ = self.status_tx.send(snapshot);
    }

    pub fn publish_positions(&self, snapshot: PositionsSnapshot) {
        let _ = self.positions_tx.send(snapshot);
    }

    pub fn publish_pnl(&self, snapshot: PnlSnapshot) {
        let _ = self.pnl_tx.send(snapshot);
    }
}

impl ControlHandle {
    pub fn status(&self) -> StatusSnapshot {
        self.status_rx.borrow().clone()
    }

    pub fn positions(&self) -> PositionsSnapshot {
        self.positions_rx.borrow().clone()
    }

    pub fn pnl(&self) -> PnlSnapshot {
        self.pnl_rx.borrow().clone()
    }
}

//! Connection state machine for one device.
//!
//! The machine is pure: it consumes [`Event`]s and returns the side-effect
//! [`Action`]s the event loop must perform. It never touches queues or
//! timers itself; states with a handshake deadline expose it through
//! [`ConnectionMachine::state_timeout`] and the loop feeds back
//! [`Event::Timeout`] when it expires.
//!
//! Open handshake: `closed` →(api-open)→ `ll-open` →(backend-open-ack)→
//! `ll-bulk-open` →(backend-bulk-ack)→ `link-reset` →(link-reset-ack)→
//! `open`. Raw open mode skips the link-reset exchange.
//!
//! Graceful close: `open` →(api-close)→ `pubsub-flush` (sentinel ping
//! drains the device pubsub queue) →(pubsub-flush)→ `link-disconnect`
//! →(link-disconnect-ack)→ `ll-close-pend` →(advance)→ `ll-close`
//! →(backend-close-ack)→ `closed`, or `finalized` when the driver is being
//! torn down. `ll-close` never exits anywhere else.

use crate::error::ErrorCode;
use num_enum::IntoPrimitive;
use std::time::Duration;
use strum_macros::Display;
use tracing::warn;

/// Deadline applied to the pubsub-flush, link-disconnect, and
/// ll-close-pend handshake states.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Device connection states, published on `h/state` as u32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive)]
#[repr(u32)]
pub enum DeviceState {
    NotPresent = 0,
    Closed = 1,
    LlOpen = 2,
    LlBulkOpen = 3,
    LinkReset = 4,
    Open = 5,
    PubsubFlush = 6,
    LinkDisconnect = 7,
    LlClosePend = 8,
    LlClose = 9,
    Finalized = 10,
}

/// Inputs to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Device presence changed (arrival or loss).
    Reset { present: bool },
    /// Loop tick progression out of `ll-close-pend`.
    Advance,
    ApiOpen { raw: bool },
    ApiClose,
    /// Terminate the driver; routes through a graceful close.
    Finalize,
    BackendOpenAck,
    BackendOpenNack { status: i32 },
    BackendBulkAck,
    BackendBulkNack { status: i32 },
    BackendCloseAck { status: i32 },
    LinkResetReq,
    LinkResetAck,
    LinkDisconnectReq,
    LinkDisconnectAck,
    /// The flush sentinel echoed back from the device.
    PubsubFlush,
    /// The active state's handshake deadline expired.
    Timeout,
}

/// Side effects the event loop must carry out, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Enqueue an open request to the backend.
    BackendOpen,
    /// Enqueue a bulk-in stream open to the backend.
    BackendBulkOpen,
    /// Enqueue a close to the backend.
    BackendClose,
    SendLinkReset,
    SendLinkResetAck,
    SendLinkDisconnect,
    SendLinkDisconnectAck,
    /// Publish the flush sentinel ping to the device.
    PublishFlushPing,
    /// Report the open status on `!open#`.
    ReportOpen(i32),
    /// Report the close status on `!close#`.
    ReportClose(i32),
    /// The state changed; publish `h/state` and restart the state timer.
    StateChanged,
}

#[derive(Debug)]
pub struct ConnectionMachine {
    state: DeviceState,
    present: bool,
    finalizing: bool,
    raw_mode: bool,
    /// Whether an application close is awaiting its `!close#` report.
    close_requested: bool,
    close_status: i32,
}

impl ConnectionMachine {
    pub fn new(present: bool) -> Self {
        Self {
            state: if present { DeviceState::Closed } else { DeviceState::NotPresent },
            present,
            finalizing: false,
            raw_mode: false,
            close_requested: false,
            close_status: 0,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn is_finalizing(&self) -> bool {
        self.finalizing
    }

    /// Handshake deadline for the current state, if it has one. The close
    /// path is fully covered so a dead device cannot wedge a finalize.
    pub fn state_timeout(&self) -> Option<Duration> {
        match self.state {
            DeviceState::PubsubFlush
            | DeviceState::LinkDisconnect
            | DeviceState::LlClosePend
            | DeviceState::LlClose => Some(HANDSHAKE_TIMEOUT),
            _ => None,
        }
    }

    /// Feed one event; returns the actions to perform.
    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        use DeviceState as S;
        use Event as E;

        let mut actions = Vec::new();

        // global pre-transition rules
        match event {
            E::Reset { present } => {
                self.present = present;
                match self.state {
                    S::LlOpen | S::LlBulkOpen | S::LinkReset => {
                        actions.push(Action::ReportOpen(ErrorCode::NotFound.as_i32()));
                    }
                    S::PubsubFlush | S::LinkDisconnect | S::LlClosePend | S::LlClose => {
                        if self.close_requested {
                            actions.push(Action::ReportClose(ErrorCode::NotFound.as_i32()));
                            self.close_requested = false;
                        }
                    }
                    _ => {}
                }
                let next = if self.finalizing {
                    S::Finalized
                } else if present {
                    S::Closed
                } else {
                    S::NotPresent
                };
                self.enter(next, &mut actions);
                return actions;
            }
            E::Finalize => {
                self.finalizing = true;
                match self.state {
                    S::NotPresent | S::Closed => {
                        self.enter(S::Finalized, &mut actions);
                        return actions;
                    }
                    _ => return self.handle_in_state(E::ApiClose, actions),
                }
            }
            _ => {}
        }

        self.handle_in_state(event, actions)
    }

    fn handle_in_state(&mut self, event: Event, mut actions: Vec<Action>) -> Vec<Action> {
        use DeviceState as S;
        use Event as E;

        match (self.state, event) {
            // -------- not present --------
            (S::NotPresent, E::ApiOpen { .. }) => {
                actions.push(Action::ReportOpen(ErrorCode::NotFound.as_i32()));
            }
            (S::NotPresent, E::ApiClose) => {
                actions.push(Action::ReportClose(ErrorCode::NotFound.as_i32()));
            }

            // -------- closed --------
            (S::Closed, E::ApiOpen { raw }) => {
                self.raw_mode = raw;
                self.close_status = 0;
                self.enter(S::LlOpen, &mut actions);
            }
            (S::Closed, E::ApiClose) => {
                actions.push(Action::ReportClose(ErrorCode::Success.as_i32()));
            }

            // -------- ll-open --------
            (S::LlOpen, E::BackendOpenAck) => self.enter(S::LlBulkOpen, &mut actions),
            (S::LlOpen, E::BackendOpenNack { status }) => {
                actions.push(Action::ReportOpen(status));
                self.enter(S::LlClose, &mut actions);
            }
            (S::LlOpen, E::ApiClose) => self.forced_close(&mut actions),

            // -------- ll-bulk-open --------
            (S::LlBulkOpen, E::BackendBulkAck) => {
                if self.raw_mode {
                    actions.push(Action::ReportOpen(ErrorCode::Success.as_i32()));
                    self.enter(S::Open, &mut actions);
                } else {
                    self.enter(S::LinkReset, &mut actions);
                }
            }
            (S::LlBulkOpen, E::BackendBulkNack { status }) => {
                actions.push(Action::ReportOpen(status));
                self.enter(S::LlClose, &mut actions);
            }
            (S::LlBulkOpen, E::ApiClose) => self.forced_close(&mut actions),

            // -------- link-reset --------
            (S::LinkReset, E::LinkResetAck) => {
                actions.push(Action::ReportOpen(ErrorCode::Success.as_i32()));
                self.enter(S::Open, &mut actions);
            }
            (S::LinkReset, E::LinkResetReq) => {
                // the device reset too; acknowledge without leaving the state
                actions.push(Action::SendLinkResetAck);
            }
            (S::LinkReset, E::ApiClose) => self.forced_close(&mut actions),

            // -------- open --------
            (S::Open, E::ApiOpen { .. }) => {
                actions.push(Action::ReportOpen(ErrorCode::InUse.as_i32()));
            }
            (S::Open, E::ApiClose) => {
                self.close_requested = true;
                self.close_status = 0;
                self.enter(S::PubsubFlush, &mut actions);
            }
            (S::Open, E::LinkResetReq) => {
                actions.push(Action::SendLinkResetAck);
            }
            (S::Open, E::LinkDisconnectReq) => {
                actions.push(Action::SendLinkDisconnectAck);
            }

            // -------- pubsub-flush --------
            (S::PubsubFlush, E::PubsubFlush) => self.enter(S::LinkDisconnect, &mut actions),
            (S::PubsubFlush, E::Timeout) => {
                self.note_close_status(ErrorCode::TimedOut.as_i32());
                self.enter(S::LlClose, &mut actions);
            }
            (S::PubsubFlush, E::ApiClose) => self.forced_close(&mut actions),

            // -------- link-disconnect --------
            (S::LinkDisconnect, E::LinkDisconnectAck) => self.enter(S::LlClosePend, &mut actions),
            (S::LinkDisconnect, E::LinkDisconnectReq) => {
                actions.push(Action::SendLinkDisconnectAck);
            }
            (S::LinkDisconnect, E::Timeout) => {
                self.note_close_status(ErrorCode::TimedOut.as_i32());
                self.enter(S::LlClose, &mut actions);
            }
            (S::LinkDisconnect, E::ApiClose) => self.forced_close(&mut actions),

            // -------- ll-close-pend --------
            (S::LlClosePend, E::Advance) => self.enter(S::LlClose, &mut actions),
            (S::LlClosePend, E::Timeout) => self.enter(S::LlClose, &mut actions),

            // -------- ll-close --------
            (S::LlClose, E::BackendCloseAck { status }) => {
                self.note_close_status(status);
                if self.close_requested {
                    actions.push(Action::ReportClose(self.close_status));
                    self.close_requested = false;
                }
                let next = if self.finalizing { S::Finalized } else { S::Closed };
                self.enter(next, &mut actions);
            }
            (S::LlClose, E::Timeout) => {
                self.note_close_status(ErrorCode::TimedOut.as_i32());
                if self.close_requested {
                    actions.push(Action::ReportClose(self.close_status));
                    self.close_requested = false;
                }
                let next = if self.finalizing { S::Finalized } else { S::Closed };
                self.enter(next, &mut actions);
            }
            (S::LlClose, E::ApiOpen { .. }) => {
                actions.push(Action::ReportOpen(ErrorCode::InUse.as_i32()));
            }

            // -------- anything else --------
            (state, event) => {
                warn!("ignoring {:?} in state {}", event, state);
            }
        }
        actions
    }

    /// An api-close in an intermediate state skips the handshakes.
    fn forced_close(&mut self, actions: &mut Vec<Action>) {
        use DeviceState as S;
        if matches!(self.state, S::LlOpen | S::LlBulkOpen | S::LinkReset) {
            // an open was in flight; it will never complete
            actions.push(Action::ReportOpen(ErrorCode::Aborted.as_i32()));
        }
        self.close_requested = true;
        self.enter(DeviceState::LlClose, actions);
    }

    fn note_close_status(&mut self, status: i32) {
        if self.close_status == 0 {
            self.close_status = status;
        }
    }

    fn enter(&mut self, next: DeviceState, actions: &mut Vec<Action>) {
        use DeviceState as S;
        if self.state == next {
            return;
        }
        self.state = next;
        actions.push(Action::StateChanged);
        match next {
            S::LlOpen => actions.push(Action::BackendOpen),
            S::LlBulkOpen => actions.push(Action::BackendBulkOpen),
            S::LinkReset => actions.push(Action::SendLinkReset),
            S::PubsubFlush => actions.push(Action::PublishFlushPing),
            S::LinkDisconnect => actions.push(Action::SendLinkDisconnect),
            S::LlClose => actions.push(Action::BackendClose),
            _ => {}
        }
    }
}

use core_types::{RequestId, TabId};
use html::{BrokenReason, CharsetSwitchRequest, ContentKind, SpeculativeLoad, TreeOperation};
use std::sync::mpsc::{self, Receiver, Sender};

#[derive(Debug)]
pub enum CoreCommand {
    ParseHtmlStart {
        tab_id: TabId,
        request_id: RequestId,
        content: ContentKind,
    },
    ParseHtmlChunk {
        tab_id: TabId,
        request_id: RequestId,
        bytes: Vec<u8>,
    },
    ParseHtmlDone {
        tab_id: TabId,
        request_id: RequestId,
    },
    ParseHtmlCancel {
        tab_id: TabId,
        request_id: RequestId,
    },
}

#[derive(Debug)]
pub enum CoreEvent {
    /// One flushed batch, in order. Batches of one request never interleave
    /// out of order.
    TreeOps {
        tab_id: TabId,
        request_id: RequestId,
        ops: Vec<TreeOperation>,
    },
    SpeculativeLoads {
        tab_id: TabId,
        request_id: RequestId,
        loads: Vec<SpeculativeLoad>,
    },
    /// The parse restarts from byte zero; everything received so far for
    /// this request must be discarded.
    CharsetSwitch {
        tab_id: TabId,
        request_id: RequestId,
        request: CharsetSwitchRequest,
    },
    ParseBroken {
        tab_id: TabId,
        request_id: RequestId,
        reason: BrokenReason,
    },
    ParseDone {
        tab_id: TabId,
        request_id: RequestId,
    },
}

impl CoreEvent {
    pub fn key(&self) -> (TabId, RequestId) {
        match self {
            CoreEvent::TreeOps {
                tab_id, request_id, ..
            }
            | CoreEvent::SpeculativeLoads {
                tab_id, request_id, ..
            }
            | CoreEvent::CharsetSwitch {
                tab_id, request_id, ..
            }
            | CoreEvent::ParseBroken {
                tab_id, request_id, ..
            }
            | CoreEvent::ParseDone { tab_id, request_id } => (*tab_id, *request_id),
        }
    }
}

pub struct Bus {
    pub cmd_tx: Sender<CoreCommand>,
    pub evt_rx: Receiver<CoreEvent>,
    pub evt_tx: Sender<CoreEvent>, // shareable for runtimes
}

impl Bus {
    /// Creates the event channel; the command receiver goes to the runtime.
    pub fn new() -> (Self, Receiver<CoreCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (evt_tx, evt_rx) = mpsc::channel();
        (
            Self {
                cmd_tx,
                evt_rx,
                evt_tx,
            },
            cmd_rx,
        )
    }
}

//! Snapshot export consumed by the debug RPC server.

use serde_json::{json, Value};

use crate::cmdlog::MAX_QPAIRS;
use crate::ctrlr::Ctrlr;
use crate::opnames::{admin_cmd_name, io_cmd_name};
use crate::transport::Transport;

/// Liveness/debug view of every active qpair: a flat array alternating the
/// log tail index and the names of the last (up to) four submitted
/// commands, newest first.
pub fn controllers_snapshot<T: Transport>(ctrlr: &Ctrlr<T>) -> Value {
    let log = ctrlr.cmdlog();
    let mut items = Vec::new();
    for qid in 0..MAX_QPAIRS {
        if !log.is_active(qid) {
            continue;
        }
        let names: Vec<&str> = log
            .dump(qid, 4)
            .iter()
            .map(|entry| {
                if qid == 0 {
                    admin_cmd_name(entry.cmd.opcode)
                } else {
                    io_cmd_name(entry.cmd.opcode)
                }
            })
            .collect();
        items.push(json!(log.tail(qid)));
        items.push(json!(names));
    }
    Value::Array(items)
}

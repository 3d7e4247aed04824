use tracing::trace;

use super::Pass;
use crate::ir::{Graph, Op};

/// Removes nodes nobody uses.
///
/// A node with no outputs at all is dropped outright (except `finish`).
/// A node without side effects whose only outputs are control edges, such
/// as a `jump` or a single-predecessor region, is spliced out of the control
/// chain and then dropped. Removing a node can leave its inputs unused, so
/// this pass is meant to be iterated to a fixpoint.
pub struct DeadCode;

impl Pass for DeadCode {
    fn name(&self) -> &str {
        "dead-code"
    }

    fn run(&self, graph: &mut Graph) -> bool {
        let mut changed = false;

        for id in graph.all_nodes() {
            if graph.node(id).is_removed() || id == graph.root() {
                continue;
            }
            let op = graph.op(id);

            if graph.outputs(id).next().is_none() {
                if op == Op::Finish {
                    continue;
                }
                trace!(node = %id, %op, "removing unused node");
                graph.remove(id);
                changed = true;
                continue;
            }

            let control_only = graph.outputs(id).all(|e| e.is_control());
            let owns_phis = graph.control_outputs(id).any(|n| graph.op(n) == Op::Phi);
            if control_only && !owns_phis && !graph.has_side_effects(id) {
                trace!(node = %id, %op, "splicing out control node");
                graph.splice_control(id);
                graph.remove(id);
                changed = true;
            }
        }

        changed
    }
}

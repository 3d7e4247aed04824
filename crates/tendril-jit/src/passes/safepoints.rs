use tracing::trace;

use super::Pass;
use crate::ir::{EdgeId, Graph, NodeId, Op};

/// Replaces `trace` nodes with safepoints at the places that need them.
///
/// Every `trace` is spliced out of the control chain. A `safepoint` is then
/// placed on each control edge into `finish` and on each control edge into
/// a merge region, which covers both loop back-edges and joins. Edges that
/// already come from a safepoint are left alone, so running the pass twice
/// changes nothing the second time.
pub struct InsertSafepoints;

impl InsertSafepoints {
    /// Control edges into `id` that do not already leave a safepoint
    fn unguarded_control_inputs(graph: &Graph, id: NodeId) -> Vec<EdgeId> {
        graph
            .input_edges(id)
            .into_iter()
            .filter(|(_, edge)| edge.is_control() && graph.op(edge.from) != Op::Safepoint)
            .map(|(edge_id, _)| edge_id)
            .collect()
    }
}

impl Pass for InsertSafepoints {
    fn name(&self) -> &str {
        "insert-safepoints"
    }

    fn run(&self, graph: &mut Graph) -> bool {
        let mut changed = false;

        for trace_node in graph.nodes_with_op(Op::Trace) {
            trace!(node = %trace_node, "removing trace");
            graph.splice_control(trace_node);
            graph.remove(trace_node);
            changed = true;
        }

        let mut targets = vec![graph.finish()];
        targets.extend(graph.find_nodes(None, |node| node.op().is_region()).into_iter().filter(
            |&region| graph.control_inputs(region).count() > 1,
        ));

        for target in targets {
            for edge in Self::unguarded_control_inputs(graph, target) {
                let safepoint = graph.add_node(Op::Safepoint);
                graph.insert_on_control_edge(edge, safepoint);
                trace!(node = %safepoint, %target, "inserted safepoint");
                changed = true;
            }
        }

        changed
    }
}

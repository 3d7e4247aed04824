use tendril_vm::{Profile, Value};
use tracing::{debug, trace};

use super::Pass;
use crate::ir::{Graph, NodeId, Op, Port};

/// Guards monomorphic send sites.
///
/// For each send whose call site has only ever seen one receiver kind, a
/// `guard` node checking that kind is placed on the control chain right
/// before the send. The guard takes the send's receiver as its `receiver`
/// input; compiled code deoptimizes when the check fails and can then call
/// the cached method directly otherwise.
pub struct InlineCaching {
    profile: Profile,
}

impl InlineCaching {
    pub fn new(profile: Profile) -> Self {
        InlineCaching { profile }
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    fn send_ip(graph: &Graph, send: NodeId) -> Option<usize> {
        graph.prop(send, "ip").and_then(Value::as_int).and_then(|ip| usize::try_from(ip).ok())
    }
}

impl Pass for InlineCaching {
    fn name(&self) -> &str {
        "inline-caching"
    }

    fn run(&self, graph: &mut Graph) -> bool {
        let mut changed = false;

        for send in graph.nodes_with_op(Op::Send) {
            let Some(ip) = Self::send_ip(graph, send) else { continue };
            let Some(kind) = self.profile.monomorphic_kind(ip) else { continue };

            let controls: Vec<_> = graph
                .input_edges(send)
                .into_iter()
                .filter(|(_, edge)| edge.is_control())
                .collect();
            let &[(edge, control)] = controls.as_slice() else { continue };
            if graph.op(control.from) == Op::Guard {
                continue;
            }
            let Some(receiver) = graph.input_for(send, Port::Receiver) else { continue };

            let guard = graph.add_node_with(
                Op::Guard,
                [("kind", Value::symbol(kind.name())), ("ip", Value::Int(ip as i64))],
            );
            graph.insert_on_control_edge(edge, guard);
            graph.output_to_as(receiver, Port::Value, guard, Port::Receiver);
            trace!(node = %guard, %send, %kind, "guarded send");
            changed = true;
        }

        if changed {
            debug!(guards = graph.nodes_with_op(Op::Guard).len(), "inline caches placed");
        }
        changed
    }
}

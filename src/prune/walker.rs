//! Dependency graph walker.
//!
//! Collects the operations whose tensors must shrink together with a pruned
//! parameter. The walk is a depth-first traversal over an explicit stack,
//! seeded with every consumer of the parameter, and the result lists
//! operations in the order they were first visited. Propagation depends on
//! that order: for a merge operation at position `i`, `path[i - 1]` is the
//! operation that led the walk into it.

use crate::graph::{Graph, OpId, OpKind, Operation, VarId};

/// Whether the walk continues past `op`.
///
/// A `conv2d` that does not own `param` consumes the pruned activation: its
/// input channels get corrected but its own outputs are unaffected. `mul` is a
/// fully-connected layer and ends channel structure.
fn expands(op: &Operation, param: VarId) -> bool {
    match op.kind {
        OpKind::Conv2d { .. } => op.consumes(param),
        OpKind::Mul { .. } => false,
        _ => true,
    }
}

/// Returns the visit path of `param`, in first-visited order.
pub fn search(graph: &Graph, param: VarId) -> Vec<OpId> {
    let ops = graph.ops();
    let mut visited = vec![false; ops.len()];
    let mut stack = graph.consumers(param);
    let mut path = Vec::new();

    while let Some(&top) = stack.last() {
        let op = &ops[top];
        if !visited[top] {
            visited[top] = true;
            path.push(top);
        }

        let next: Vec<OpId> = if expands(op, param) {
            op.output_vars()
                .into_iter()
                .flat_map(|out| graph.consumers(out))
                .filter(|&candidate| !visited[candidate])
                .collect()
        } else {
            Vec::new()
        };

        if next.is_empty() {
            stack.pop();
        } else {
            stack.extend(next);
        }
    }
    path
}

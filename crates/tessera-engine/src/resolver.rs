//! Topological ordering of steps by declared dependencies.

use std::collections::HashMap;

use tessera_core::error::{Result, TesseraError};
use tessera_core::workflow::WorkflowStep;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Order nodes so every node follows all of its dependencies.
///
/// Input is `(id, dependencies)` in declaration order. Ties are broken by
/// declaration order, so the result is deterministic. Dependencies on ids
/// that are not in the input are ignored here; definition validation rejects
/// them separately.
pub fn resolve_order(nodes: &[(String, Vec<String>)]) -> Result<Vec<String>> {
    let index: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, (id, _))| (id.as_str(), i))
        .collect();

    let mut marks: Vec<Option<Mark>> = vec![None; nodes.len()];
    let mut order = Vec::with_capacity(nodes.len());

    for start in 0..nodes.len() {
        if marks[start].is_some() {
            continue;
        }
        // Iterative DFS: (node, next dependency to look at).
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
        marks[start] = Some(Mark::Visiting);

        while let Some(top) = stack.last_mut() {
            let node = top.0;
            let deps = &nodes[node].1;
            if top.1 < deps.len() {
                let dep = &deps[top.1];
                top.1 += 1;
                let Some(&dep_idx) = index.get(dep.as_str()) else {
                    continue;
                };
                match marks[dep_idx] {
                    Some(Mark::Visiting) => {
                        return Err(TesseraError::CyclicDependency {
                            step: dep.clone(),
                        });
                    }
                    Some(Mark::Done) => {}
                    None => {
                        marks[dep_idx] = Some(Mark::Visiting);
                        stack.push((dep_idx, 0));
                    }
                }
            } else {
                marks[node] = Some(Mark::Done);
                order.push(nodes[node].0.clone());
                stack.pop();
            }
        }
    }

    Ok(order)
}

/// Order workflow steps by their `dependencies`.
pub fn resolve_steps(steps: &[WorkflowStep]) -> Result<Vec<String>> {
    let nodes: Vec<(String, Vec<String>)> = steps
        .iter()
        .map(|s| (s.id.clone(), s.dependencies.clone()))
        .collect();
    resolve_order(&nodes)
}

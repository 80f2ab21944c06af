// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::hash::Hash;

use petgraph::{
    graph::{DiGraph, NodeIndex},
    Direction,
};

/// A dependency cycle, reported as the chain of nodes that
/// closes back on itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle<N> {
    pub path: Vec<N>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

struct Frame {
    node: NodeIndex,
    children: Vec<NodeIndex>,
    cursor: usize,
}

/// Iterative depth-first post-order over `graph` from `starts`.
///
/// Gray = on the current DFS path, black = emitted. An edge into a
/// gray node closes a cycle; the path is recovered from the explicit
/// stack. Black revisits are no-ops.
pub(crate) fn sort<N>(graph: &DiGraph<N, ()>, starts: &[NodeIndex]) -> Result<Vec<N>, Cycle<N>>
where
    N: Clone + Eq + Hash + Ord,
{
    let mut colors = vec![Color::White; graph.node_count()];
    let mut order = vec![];

    for start in starts {
        if colors[start.index()] != Color::White {
            continue;
        }

        colors[start.index()] = Color::Gray;
        let mut stack = vec![Frame {
            node: *start,
            children: children(graph, *start),
            cursor: 0,
        }];

        loop {
            // Advance the top frame, releasing the borrow before the
            // stack is grown or shrunk
            let next = match stack.last_mut() {
                Some(frame) => {
                    let adj = frame.children.get(frame.cursor).copied();
                    if adj.is_some() {
                        frame.cursor += 1;
                    }
                    adj
                }
                None => break,
            };

            match next {
                Some(adj) => match colors[adj.index()] {
                    Color::White => {
                        colors[adj.index()] = Color::Gray;
                        stack.push(Frame {
                            node: adj,
                            children: children(graph, adj),
                            cursor: 0,
                        });
                    }
                    Color::Gray => {
                        // Everything from the first occurrence of
                        // `adj` on the stack down to here is on the
                        // cycle
                        let from = stack.iter().position(|frame| frame.node == adj).unwrap_or_default();
                        let mut path = stack[from..].iter().map(|frame| graph[frame.node].clone()).collect::<Vec<_>>();
                        path.push(graph[adj].clone());

                        return Err(Cycle { path });
                    }
                    Color::Black => {}
                },
                None => {
                    let frame = stack.pop().expect("non-empty stack");
                    colors[frame.node.index()] = Color::Black;
                    order.push(graph[frame.node].clone());
                }
            }
        }
    }

    Ok(order)
}

fn children<N: Ord>(graph: &DiGraph<N, ()>, node: NodeIndex) -> Vec<NodeIndex> {
    let mut kids = graph.neighbors_directed(node, Direction::Outgoing).collect::<Vec<_>>();
    kids.sort_by(|a, b| graph[*a].cmp(&graph[*b]));
    kids
}

//! Tensor buffer planner.
//!
//! Assigns every tensor key a slot in one flat arena, honouring: externally
//! visible tensors (model inputs and outputs) get pinned, stably-addressed
//! slots; an intermediate may alias its first input iff the operation
//! tolerates aliasing and no other live consumer of that input remains;
//! slots of dead intermediates return to a free pool. All slots are rounded
//! up to whole 4-float quads so packed tail moves stay inside the slot, and
//! the arena carries one extra quad of tail slack.
//!
//! The planner works on lowered nodes rather than the raw graph so that
//! fused and synthetic nodes (folded batchnorm, split softmax, uint8
//! staging) plan exactly like ordinary ones.

use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};
use crate::model::TensorLocation;

/// One buffer slot inside the arena, in float units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub offset: usize,
    pub floats: usize,
}

/// Storage behaviour of one lowered node.
#[derive(Debug)]
pub struct PlanNode {
    pub inputs: Vec<TensorLocation>,
    /// `(key, floats)` per produced tensor.
    pub outputs: Vec<(TensorLocation, usize)>,
    pub scratch_floats: usize,
    /// The emitted code tolerates the first input aliasing the output.
    pub inplace: bool,
    /// Outputs are written externally (model input buffers): pinned.
    pub external: bool,
}

#[derive(Debug)]
pub struct Plan {
    pub slots: HashMap<TensorLocation, Slot>,
    /// Scratch slot per node, in node order.
    pub scratch: Vec<Option<Slot>>,
    pub total_floats: usize,
}

const QUAD: usize = 4;

fn round_quad(floats: usize) -> usize {
    floats.div_ceil(QUAD) * QUAD
}

struct Allocator {
    free: Vec<Slot>,
    total: usize,
}

impl Allocator {
    fn alloc(&mut self, floats: usize) -> Slot {
        let floats = round_quad(floats);
        // Best fit from the free pool.
        let mut best: Option<usize> = None;
        for (i, slot) in self.free.iter().enumerate() {
            if slot.floats >= floats && best.map_or(true, |b| slot.floats < self.free[b].floats) {
                best = Some(i);
            }
        }
        if let Some(i) = best {
            return self.free.swap_remove(i);
        }
        let slot = Slot {
            offset: self.total,
            floats,
        };
        self.total += floats;
        slot
    }

    fn release(&mut self, slot: Slot) {
        self.free.push(slot);
    }
}

pub fn plan(nodes: &[PlanNode], model_outputs: &[TensorLocation]) -> Result<Plan> {
    // Remaining-consumer counts; model outputs get one extra permanent
    // count so they can never be consumed in-place.
    let mut refcount: HashMap<TensorLocation, usize> = HashMap::new();
    for node in nodes {
        for &loc in &node.inputs {
            *refcount.entry(loc).or_insert(0) += 1;
        }
    }
    for &loc in model_outputs {
        *refcount.entry(loc).or_insert(0) += 1;
    }

    // Pinned slots (externally visible addresses) never return to the pool.
    let mut pinned: HashSet<TensorLocation> = model_outputs.iter().copied().collect();
    for node in nodes {
        if node.external {
            for &(key, _) in &node.outputs {
                pinned.insert(key);
            }
        }
    }

    let mut alloc = Allocator {
        free: Vec::new(),
        total: 0,
    };
    let mut slots: HashMap<TensorLocation, Slot> = HashMap::new();
    let mut scratch: Vec<Option<Slot>> = Vec::with_capacity(nodes.len());

    for node in nodes {
        // In-place: single output aliasing the first input.
        let mut inplace_slot: Option<Slot> = None;
        if node.inplace && node.outputs.len() == 1 {
            if let Some(&first) = node.inputs.first() {
                let count = refcount.get(&first).copied().unwrap_or(0);
                if count == 1 {
                    if let Some(&slot) = slots.get(&first) {
                        if slot.floats >= round_quad(node.outputs[0].1) {
                            inplace_slot = Some(slot);
                        }
                    }
                }
            }
        }

        for (index, &(key, floats)) in node.outputs.iter().enumerate() {
            let slot = match inplace_slot {
                Some(slot) if index == 0 => {
                    // The aliased input keeps its address; if it was pinned
                    // (a model input), the new owner inherits the pin.
                    if pinned.contains(&node.inputs[0]) {
                        pinned.insert(key);
                    }
                    slot
                }
                _ => alloc.alloc(floats),
            };
            if slots.insert(key, slot).is_some() {
                return Err(Error::Compile(format!(
                    "tensor ({}, {}, {}) produced twice",
                    key.layer, key.node_index, key.tensor_index
                )));
            }
        }

        // Consume inputs and recycle the ones that just died.
        for &loc in &node.inputs {
            let count = refcount
                .get_mut(&loc)
                .ok_or_else(|| Error::Compile("input without refcount".into()))?;
            *count -= 1;
            if *count == 0 && !pinned.contains(&loc) {
                if inplace_slot.is_some() && loc == node.inputs[0] {
                    continue; // slot lives on as this node's output
                }
                if let Some(&slot) = slots.get(&loc) {
                    alloc.release(slot);
                }
            }
        }

        // Scratch lives only while the node runs.
        if node.scratch_floats > 0 {
            let slot = alloc.alloc(node.scratch_floats);
            scratch.push(Some(slot));
            alloc.release(slot);
        } else {
            scratch.push(None);
        }
    }

    for &loc in model_outputs {
        if !slots.contains_key(&loc) {
            return Err(Error::InvalidGraph(format!(
                "model output ({}, {}, {}) was never produced",
                loc.layer, loc.node_index, loc.tensor_index
            )));
        }
    }

    Ok(Plan {
        slots,
        scratch,
        total_floats: alloc.total + QUAD,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(i: usize) -> TensorLocation {
        TensorLocation::new(i, 0, 0)
    }

    fn external(i: usize, floats: usize) -> PlanNode {
        PlanNode {
            inputs: vec![],
            outputs: vec![(key(i), floats)],
            scratch_floats: 0,
            inplace: false,
            external: true,
        }
    }

    fn siso(from: usize, to: usize, floats: usize, inplace: bool) -> PlanNode {
        PlanNode {
            inputs: vec![key(from)],
            outputs: vec![(key(to), floats)],
            scratch_floats: 0,
            inplace,
            external: false,
        }
    }

    #[test]
    fn inplace_chain_shares_one_slot() {
        let nodes = vec![
            external(0, 8),
            siso(0, 1, 8, true),
            siso(1, 2, 8, true),
            siso(2, 3, 8, true),
        ];
        let plan = plan(&nodes, &[key(3)]).unwrap();
        assert_eq!(plan.slots[&key(0)], plan.slots[&key(3)]);
        assert_eq!(plan.total_floats, 8 + 4);
    }

    #[test]
    fn non_inplace_node_gets_fresh_slot() {
        let nodes = vec![external(0, 8), siso(0, 1, 8, false)];
        let plan = plan(&nodes, &[key(1)]).unwrap();
        assert_ne!(plan.slots[&key(0)], plan.slots[&key(1)]);
    }

    #[test]
    fn model_output_pin_blocks_inplace() {
        // The input is also a model output, so the relu must not alias it.
        let nodes = vec![external(0, 8), siso(0, 1, 8, true)];
        let plan = plan(&nodes, &[key(0), key(1)]).unwrap();
        assert_ne!(plan.slots[&key(0)], plan.slots[&key(1)]);
    }

    #[test]
    fn second_consumer_blocks_inplace() {
        let nodes = vec![
            external(0, 8),
            siso(0, 1, 8, true),
            PlanNode {
                inputs: vec![key(0), key(1)],
                outputs: vec![(key(2), 8)],
                scratch_floats: 0,
                inplace: false,
                external: false,
            },
        ];
        let plan = plan(&nodes, &[key(2)]).unwrap();
        assert_ne!(plan.slots[&key(0)], plan.slots[&key(1)]);
    }

    #[test]
    fn dead_intermediate_slot_is_reused() {
        let nodes = vec![
            external(0, 8),
            siso(0, 1, 8, false),
            siso(1, 2, 8, false),
            siso(2, 3, 8, false),
        ];
        let plan = plan(&nodes, &[key(3)]).unwrap();
        // Ping-pong between two intermediate slots plus the pinned input.
        assert!(plan.total_floats <= 3 * 8 + 4);
        assert_eq!(plan.slots[&key(1)], plan.slots[&key(3)]);
    }

    #[test]
    fn scratch_is_recycled_immediately() {
        let mut conv = siso(0, 1, 8, false);
        conv.scratch_floats = 32;
        let nodes = vec![external(0, 8), conv, siso(1, 2, 32, false)];
        let plan = plan(&nodes, &[key(2)]).unwrap();
        let scratch = plan.scratch[1].unwrap();
        assert_eq!(plan.slots[&key(2)], scratch);
    }

    #[test]
    fn slots_are_quad_rounded() {
        let nodes = vec![external(0, 5)];
        let plan = plan(&nodes, &[key(0)]).unwrap();
        assert_eq!(plan.slots[&key(0)].floats, 8);
    }
}

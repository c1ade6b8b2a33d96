//! Reindex planning for scoped collections.
//!
//! Pure planning functions that keep each scope's live items at orders
//! `1..=N` across inserts, moves, and soft deletes. A plan is a list of
//! order writes; it performs no I/O itself, so a caller can commit the
//! whole plan as one atomic unit.
//!
//! ```text
//! insert after 2 into [A=1 B=2 C=3]     move C to 1 in [A=1 B=2 C=3]
//!          │                                     │
//!          ▼                                     ▼
//!   target: new → 3                        target: C → 1
//!   shifts: C 3→4                          shifts: A 1→2, B 2→3
//! ```
//!
//! Tie-break rule: the item named in the request always wins its target
//! order; every other affected item shifts away by exactly one. Applying a
//! plan can therefore never leave two live items sharing an order.

use std::fmt;
use uuid::Uuid;

use crate::item::{OrderedItem, DELETED_ORDER};

/// One order-field write produced by a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderWrite {
    pub item_id: Uuid,
    pub new_order: i64,
}

/// The writes that restore contiguity after one logical change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReindexPlan {
    /// Write for the item named in the request (or the item being created).
    pub target: OrderWrite,
    /// Compensating writes for every other affected item.
    pub shifts: Vec<OrderWrite>,
}

impl ReindexPlan {
    /// Total number of order writes this plan applies.
    pub fn write_count(&self) -> usize {
        1 + self.shifts.len()
    }
}

/// Order planning errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderError {
    /// Requested position falls outside the valid range for the scope's
    /// current live count.
    InvalidOrder { given: i64, live_count: usize },
    /// The named item is not a live member of the scope.
    UnknownItem(Uuid),
}

impl fmt::Display for OrderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderError::InvalidOrder { given, live_count } => {
                write!(
                    f,
                    "order {given} is invalid for a scope with {live_count} live items"
                )
            }
            OrderError::UnknownItem(id) => write!(f, "item {id} is not a live member of the scope"),
        }
    }
}

impl std::error::Error for OrderError {}

fn live_count(items: &[OrderedItem]) -> i64 {
    items.iter().filter(|i| i.is_live()).count() as i64
}

fn find_live(items: &[OrderedItem], item_id: Uuid) -> Result<&OrderedItem, OrderError> {
    items
        .iter()
        .find(|i| i.is_live() && i.id == item_id)
        .ok_or(OrderError::UnknownItem(item_id))
}

/// Plan inserting a new item after position `after_order`.
///
/// `after_order = 0` inserts at the head, `after_order = N` appends. The new
/// item takes `after_order + 1` and every live item at or past that position
/// shifts up by one. Positions outside `[0, N]` fail with `InvalidOrder`.
pub fn plan_insert(
    items: &[OrderedItem],
    new_item_id: Uuid,
    after_order: i64,
) -> Result<ReindexPlan, OrderError> {
    let n = live_count(items);
    if after_order < 0 || after_order > n {
        return Err(OrderError::InvalidOrder {
            given: after_order,
            live_count: n as usize,
        });
    }

    let new_order = after_order + 1;
    let shifts = items
        .iter()
        .filter(|i| i.is_live() && i.order >= new_order)
        .map(|i| OrderWrite {
            item_id: i.id,
            new_order: i.order + 1,
        })
        .collect();

    Ok(ReindexPlan {
        target: OrderWrite {
            item_id: new_item_id,
            new_order,
        },
        shifts,
    })
}

/// Plan moving a live item to `to_order`.
///
/// Accepts targets in `[1, N+1]`; `N+1` means "past the end" and is treated
/// as a move to position `N`, the last slot a live member can occupy without
/// leaving a gap. Returns `Ok(None)` when the item already holds the target
/// position: the caller skips the whole mutation (no writes, no broadcast).
pub fn plan_move(
    items: &[OrderedItem],
    item_id: Uuid,
    to_order: i64,
) -> Result<Option<ReindexPlan>, OrderError> {
    let n = live_count(items);
    let item = find_live(items, item_id)?;

    if to_order < 1 || to_order > n + 1 {
        return Err(OrderError::InvalidOrder {
            given: to_order,
            live_count: n as usize,
        });
    }
    let to_order = to_order.min(n);
    let from_order = item.order;
    if to_order == from_order {
        return Ok(None);
    }

    let shifts: Vec<OrderWrite> = if to_order > from_order {
        // Everything between the vacated slot and the target slides down.
        items
            .iter()
            .filter(|i| i.is_live() && i.order > from_order && i.order <= to_order)
            .map(|i| OrderWrite {
                item_id: i.id,
                new_order: i.order - 1,
            })
            .collect()
    } else {
        // Everything from the target up to the vacated slot slides up.
        items
            .iter()
            .filter(|i| i.is_live() && i.order >= to_order && i.order < from_order)
            .map(|i| OrderWrite {
                item_id: i.id,
                new_order: i.order + 1,
            })
            .collect()
    };

    Ok(Some(ReindexPlan {
        target: OrderWrite {
            item_id,
            new_order: to_order,
        },
        shifts,
    }))
}

/// Plan soft-deleting a live item.
///
/// The named item takes the sentinel order and leaves the sequence; every
/// live item past it decrements by one, closing the gap.
pub fn plan_soft_delete(items: &[OrderedItem], item_id: Uuid) -> Result<ReindexPlan, OrderError> {
    let item = find_live(items, item_id)?;
    let deleted_order = item.order;

    let shifts = items
        .iter()
        .filter(|i| i.is_live() && i.order > deleted_order)
        .map(|i| OrderWrite {
            item_id: i.id,
            new_order: i.order - 1,
        })
        .collect();

    Ok(ReindexPlan {
        target: OrderWrite {
            item_id,
            new_order: DELETED_ORDER,
        },
        shifts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{orders_contiguous, Scope};

    fn scope_items(names: &[&str]) -> Vec<OrderedItem> {
        let scope = Scope::team(Uuid::new_v4());
        let actor = Uuid::new_v4();
        names
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                OrderedItem::new(Uuid::new_v4(), scope, *name, idx as i64 + 1, actor)
            })
            .collect()
    }

    fn id_of(items: &[OrderedItem], name: &str) -> Uuid {
        items
            .iter()
            .find(|i| i.name == name)
            .map(|i| i.id)
            .unwrap()
    }

    fn order_of(items: &[OrderedItem], name: &str) -> i64 {
        items
            .iter()
            .find(|i| i.name == name)
            .map(|i| i.order)
            .unwrap()
    }

    /// Apply a plan's order writes the way a store would, marking the
    /// target deleted when it received the sentinel.
    fn apply_plan(items: &mut [OrderedItem], plan: &ReindexPlan) {
        for write in plan.shifts.iter().chain(std::iter::once(&plan.target)) {
            if let Some(item) = items.iter_mut().find(|i| i.id == write.item_id) {
                if write.new_order == DELETED_ORDER {
                    item.mark_deleted(Uuid::new_v4());
                } else {
                    item.order = write.new_order;
                }
            }
        }
    }

    #[test]
    fn test_insert_append_shifts_nothing() {
        let items = scope_items(&["a", "b", "c"]);
        let plan = plan_insert(&items, Uuid::new_v4(), 3).unwrap();
        assert_eq!(plan.target.new_order, 4);
        assert!(plan.shifts.is_empty());
    }

    #[test]
    fn test_insert_at_head_shifts_everything() {
        let mut items = scope_items(&["a", "b", "c"]);
        let new_id = Uuid::new_v4();
        let plan = plan_insert(&items, new_id, 0).unwrap();
        assert_eq!(plan.target.new_order, 1);
        assert_eq!(plan.shifts.len(), 3);

        apply_plan(&mut items, &plan);
        items.push(OrderedItem::new(
            new_id,
            items[0].scope,
            "new",
            plan.target.new_order,
            Uuid::new_v4(),
        ));
        assert!(orders_contiguous(&items));
        assert_eq!(order_of(&items, "new"), 1);
        assert_eq!(order_of(&items, "a"), 2);
        assert_eq!(order_of(&items, "c"), 4);
    }

    #[test]
    fn test_insert_mid_scope() {
        let items = scope_items(&["a", "b", "c", "d"]);
        let plan = plan_insert(&items, Uuid::new_v4(), 2).unwrap();
        assert_eq!(plan.target.new_order, 3);
        // Only c and d move.
        assert_eq!(plan.shifts.len(), 2);
        assert!(plan
            .shifts
            .iter()
            .any(|w| w.item_id == id_of(&items, "c") && w.new_order == 4));
        assert!(plan
            .shifts
            .iter()
            .any(|w| w.item_id == id_of(&items, "d") && w.new_order == 5));
    }

    #[test]
    fn test_insert_position_out_of_range() {
        let items = scope_items(&["a", "b"]);
        assert!(matches!(
            plan_insert(&items, Uuid::new_v4(), -1),
            Err(OrderError::InvalidOrder { given: -1, .. })
        ));
        assert!(matches!(
            plan_insert(&items, Uuid::new_v4(), 3),
            Err(OrderError::InvalidOrder { given: 3, .. })
        ));
    }

    #[test]
    fn test_insert_into_empty_scope() {
        let plan = plan_insert(&[], Uuid::new_v4(), 0).unwrap();
        assert_eq!(plan.target.new_order, 1);
        assert!(plan.shifts.is_empty());
    }

    #[test]
    fn test_move_to_front() {
        // A=1 B=2 C=3, move C to 1 → C=1, A=2, B=3.
        let mut items = scope_items(&["A", "B", "C"]);
        let plan = plan_move(&items, id_of(&items, "C"), 1).unwrap().unwrap();

        apply_plan(&mut items, &plan);
        assert!(orders_contiguous(&items));
        assert_eq!(order_of(&items, "C"), 1);
        assert_eq!(order_of(&items, "A"), 2);
        assert_eq!(order_of(&items, "B"), 3);
    }

    #[test]
    fn test_move_toward_end() {
        let mut items = scope_items(&["a", "b", "c", "d"]);
        let plan = plan_move(&items, id_of(&items, "a"), 3).unwrap().unwrap();
        assert_eq!(plan.shifts.len(), 2);

        apply_plan(&mut items, &plan);
        assert!(orders_contiguous(&items));
        assert_eq!(order_of(&items, "b"), 1);
        assert_eq!(order_of(&items, "c"), 2);
        assert_eq!(order_of(&items, "a"), 3);
        assert_eq!(order_of(&items, "d"), 4);
    }

    #[test]
    fn test_move_to_current_position_is_noop() {
        let items = scope_items(&["a", "b", "c"]);
        let plan = plan_move(&items, id_of(&items, "b"), 2).unwrap();
        assert!(plan.is_none());
    }

    #[test]
    fn test_move_past_end_means_last_position() {
        let mut items = scope_items(&["a", "b", "c"]);
        let plan = plan_move(&items, id_of(&items, "a"), 4).unwrap().unwrap();
        assert_eq!(plan.target.new_order, 3);

        apply_plan(&mut items, &plan);
        assert!(orders_contiguous(&items));
        assert_eq!(order_of(&items, "a"), 3);

        // An item already last sees past-the-end as its own position.
        let plan = plan_move(&items, id_of(&items, "a"), 4).unwrap();
        assert!(plan.is_none());
    }

    #[test]
    fn test_move_order_out_of_range() {
        let items = scope_items(&["a", "b", "c"]);
        let id = id_of(&items, "a");
        assert!(matches!(
            plan_move(&items, id, 0),
            Err(OrderError::InvalidOrder { given: 0, .. })
        ));
        assert!(matches!(
            plan_move(&items, id, 5),
            Err(OrderError::InvalidOrder { given: 5, .. })
        ));
    }

    #[test]
    fn test_move_unknown_item() {
        let items = scope_items(&["a", "b"]);
        let stranger = Uuid::new_v4();
        assert_eq!(
            plan_move(&items, stranger, 1),
            Err(OrderError::UnknownItem(stranger))
        );
    }

    #[test]
    fn test_move_never_duplicates_orders() {
        // The named item wins its target order; everything else shifts away.
        let mut items = scope_items(&["a", "b", "c", "d", "e"]);
        let plan = plan_move(&items, id_of(&items, "d"), 2).unwrap().unwrap();

        apply_plan(&mut items, &plan);
        assert_eq!(order_of(&items, "d"), 2);
        let mut seen: Vec<i64> = items.iter().map(|i| i.order).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), items.len(), "duplicate order after move");
    }

    #[test]
    fn test_delete_middle_closes_gap() {
        // Five items, delete the 3rd → survivors hold {1,2,3,4} in the
        // original relative sequence.
        let mut items = scope_items(&["a", "b", "c", "d", "e"]);
        let plan = plan_soft_delete(&items, id_of(&items, "c")).unwrap();
        assert_eq!(plan.target.new_order, DELETED_ORDER);
        assert_eq!(plan.shifts.len(), 2);

        apply_plan(&mut items, &plan);
        assert!(orders_contiguous(&items));
        assert_eq!(order_of(&items, "a"), 1);
        assert_eq!(order_of(&items, "b"), 2);
        assert_eq!(order_of(&items, "d"), 3);
        assert_eq!(order_of(&items, "e"), 4);
        assert_eq!(order_of(&items, "c"), DELETED_ORDER);
    }

    #[test]
    fn test_delete_scenario_b_from_three() {
        // {A=1,B=2,C=3} delete B → {A=1, C=2}, B.order = -1.
        let mut items = scope_items(&["A", "B", "C"]);
        let plan = plan_soft_delete(&items, id_of(&items, "B")).unwrap();

        apply_plan(&mut items, &plan);
        assert_eq!(order_of(&items, "A"), 1);
        assert_eq!(order_of(&items, "C"), 2);
        assert_eq!(order_of(&items, "B"), DELETED_ORDER);
        assert!(!items.iter().find(|i| i.name == "B").unwrap().is_live());
    }

    #[test]
    fn test_delete_last_item_shifts_nothing() {
        let items = scope_items(&["a", "b", "c"]);
        let plan = plan_soft_delete(&items, id_of(&items, "c")).unwrap();
        assert!(plan.shifts.is_empty());
    }

    #[test]
    fn test_deleted_item_is_unknown_to_further_plans() {
        let mut items = scope_items(&["a", "b", "c"]);
        let b = id_of(&items, "b");
        let plan = plan_soft_delete(&items, b).unwrap();
        apply_plan(&mut items, &plan);

        assert_eq!(plan_soft_delete(&items, b), Err(OrderError::UnknownItem(b)));
        assert_eq!(plan_move(&items, b, 1), Err(OrderError::UnknownItem(b)));
    }

    #[test]
    fn test_contiguity_holds_across_mixed_operations() {
        let mut items = scope_items(&["a", "b", "c", "d"]);
        let scope = items[0].scope;
        let actor = Uuid::new_v4();

        // insert "e" after b
        let e = Uuid::new_v4();
        let plan = plan_insert(&items, e, 2).unwrap();
        apply_plan(&mut items, &plan);
        items.push(OrderedItem::new(e, scope, "e", plan.target.new_order, actor));
        assert!(orders_contiguous(&items));

        // move d to the front
        let plan = plan_move(&items, id_of(&items, "d"), 1).unwrap().unwrap();
        apply_plan(&mut items, &plan);
        assert!(orders_contiguous(&items));

        // delete b, then move e to the end
        let plan = plan_soft_delete(&items, id_of(&items, "b")).unwrap();
        apply_plan(&mut items, &plan);
        assert!(orders_contiguous(&items));

        let plan = plan_move(&items, e, 4).unwrap().unwrap();
        apply_plan(&mut items, &plan);
        assert!(orders_contiguous(&items));

        // d a c e with b gone
        assert_eq!(order_of(&items, "d"), 1);
        assert_eq!(order_of(&items, "a"), 2);
        assert_eq!(order_of(&items, "c"), 3);
        assert_eq!(order_of(&items, "e"), 4);
    }

    #[test]
    fn test_error_display() {
        let err = OrderError::InvalidOrder {
            given: 9,
            live_count: 3,
        };
        assert!(err.to_string().contains("9"));
        assert!(err.to_string().contains("3 live items"));

        let id = Uuid::new_v4();
        assert!(OrderError::UnknownItem(id).to_string().contains(&id.to_string()));
    }
}

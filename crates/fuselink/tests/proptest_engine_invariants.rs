//! Property-based invariant tests for the engine:
//!
//! 1. "Shares a cell with" stays an equivalence relation under arbitrary
//!    join/isolate/submit sequences, and matches a model partition.
//! 2. Hooks of one domain agree on the value by reference identity.
//! 3. The live cell count equals the number of distinct domains.
//! 4. Check-only submissions never mutate state, and a check-only success
//!    implies the same proposal commits in normal mode.
//! 5. Value completion reaches a fixed point for declaratively convergent
//!    composite chains, and trips the round cap when a chain outruns it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use proptest::prelude::*;

use fuselink::{
    CompositeContract, CompositeSpec, Coordinator, ErrorKind, Hook, KeyValues, SubmitMode,
    UpdateView, ValuePatch, dyn_value,
};

// ── Model-based partition testing ───────────────────────────────────────

const HOOKS: usize = 6;

#[derive(Debug, Clone)]
enum Op {
    Join(usize, usize),
    Isolate(usize),
    Submit(usize, i64),
    ForcedSubmit(usize, i64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..HOOKS, 0..HOOKS).prop_map(|(a, b)| Op::Join(a, b)),
        (0..HOOKS).prop_map(Op::Isolate),
        (0..HOOKS, -50..50_i64).prop_map(|(i, v)| Op::Submit(i, v)),
        (0..HOOKS, -50..50_i64).prop_map(|(i, v)| Op::ForcedSubmit(i, v)),
    ]
}

/// Reference model: a label per hook (same label ⇔ same domain) plus a
/// value per label.
struct Model {
    labels: Vec<usize>,
    values: HashMap<usize, i64>,
    next_label: usize,
}

impl Model {
    fn new(initial: &[i64]) -> Self {
        Self {
            labels: (0..initial.len()).collect(),
            values: initial.iter().copied().enumerate().collect(),
            next_label: initial.len(),
        }
    }

    fn apply(&mut self, op: &Op) {
        match *op {
            Op::Join(a, b) => {
                let (la, lb) = (self.labels[a], self.labels[b]);
                if la != lb {
                    // The caller's value survives the fusion.
                    for label in &mut self.labels {
                        if *label == lb {
                            *label = la;
                        }
                    }
                    self.values.remove(&lb);
                }
            }
            Op::Isolate(i) => {
                let label = self.labels[i];
                if self.labels.iter().filter(|l| **l == label).count() > 1 {
                    let fresh = self.next_label;
                    self.next_label += 1;
                    self.labels[i] = fresh;
                    self.values.insert(fresh, self.values[&label]);
                }
            }
            Op::Submit(i, v) | Op::ForcedSubmit(i, v) => {
                self.values.insert(self.labels[i], v);
            }
        }
    }
}

proptest! {
    #[test]
    fn partition_and_values_match_the_model(
        initial in proptest::collection::vec(-50..50_i64, HOOKS),
        ops in proptest::collection::vec(op_strategy(), 1..40),
    ) {
        let coordinator = Coordinator::new();
        let hooks: Vec<Hook<i64>> = initial
            .iter()
            .map(|v| Hook::new(&coordinator, *v))
            .collect();
        let mut model = Model::new(&initial);

        for op in &ops {
            match *op {
                Op::Join(a, b) => hooks[a].join(&hooks[b]).unwrap(),
                Op::Isolate(i) => hooks[i].isolate(),
                Op::Submit(i, v) => hooks[i].submit(v).unwrap(),
                Op::ForcedSubmit(i, v) => {
                    hooks[i].submit_with(v, SubmitMode::Forced).unwrap();
                }
            }
            model.apply(op);

            // Partition matches: same label ⇔ shares a cell.
            for i in 0..HOOKS {
                for j in (i + 1)..HOOKS {
                    let same_model = model.labels[i] == model.labels[j];
                    prop_assert_eq!(
                        hooks[i].is_joined_with(&hooks[j]),
                        same_model,
                        "hooks {} and {} disagree with the model after {:?}",
                        i, j, op
                    );
                    if same_model {
                        // One cell, one allocation: identity agreement.
                        prop_assert!(Arc::ptr_eq(&hooks[i].value(), &hooks[j].value()));
                    }
                }
            }

            // Values match the model.
            for i in 0..HOOKS {
                prop_assert_eq!(*hooks[i].value(), model.values[&model.labels[i]]);
            }

            // One live cell per distinct domain.
            let domains: HashSet<usize> = model.labels.iter().copied().collect();
            prop_assert_eq!(coordinator.cell_count(), domains.len());
        }
    }
}

// ── Check-only purity ───────────────────────────────────────────────────

proptest! {
    #[test]
    fn check_only_is_pure_and_predicts_normal_mode(
        initial in proptest::collection::vec(-20..20_i64, 4),
        proposed in proptest::collection::vec(-20..20_i64, 4),
        mask in proptest::collection::vec(any::<bool>(), 4),
    ) {
        let coordinator = Coordinator::new();
        let mut hooks: Vec<Hook<i64>> = Vec::new();
        for (index, v) in initial.iter().enumerate() {
            let hook = if index == 0 {
                // One guarded hook so some proposals fail validation.
                Hook::builder(&coordinator, *v)
                    .validator(|v| if *v >= 0 { Ok(()) } else { Err("negative".into()) })
                    .build()
            } else {
                Hook::new(&coordinator, *v)
            };
            hooks.push(hook);
        }
        // The guarded hook may start invalid; skip those runs.
        prop_assume!(initial[0] >= 0);

        let proposal: Vec<_> = hooks
            .iter()
            .zip(&proposed)
            .zip(&mask)
            .filter(|(_, include)| **include)
            .map(|((hook, value), _)| (hook.cell_ref(), dyn_value(*value)))
            .collect();

        let snapshot: Vec<i64> = hooks.iter().map(|h| *h.value()).collect();
        let checked = coordinator.submit(proposal.clone(), SubmitMode::CheckOnly);

        // Check-only never mutates, success or not.
        let after_check: Vec<i64> = hooks.iter().map(|h| *h.value()).collect();
        prop_assert_eq!(&snapshot, &after_check);

        match checked {
            Ok(_) => {
                coordinator.submit(proposal, SubmitMode::Normal).unwrap();
                for (hook, (value, include)) in hooks.iter().zip(proposed.iter().zip(&mask)) {
                    if *include {
                        prop_assert_eq!(*hook.value(), *value);
                    }
                }
            }
            Err(err) => {
                prop_assert_eq!(err.kind(), ErrorKind::ValidationRejected);
                let failed = coordinator.submit(proposal, SubmitMode::Normal).unwrap_err();
                prop_assert_eq!(failed.kind(), ErrorKind::ValidationRejected);
                let after_fail: Vec<i64> = hooks.iter().map(|h| *h.value()).collect();
                prop_assert_eq!(&snapshot, &after_fail);
            }
        }
    }
}

// ── Completion fixed point ──────────────────────────────────────────────

/// A two-primary composite maintaining `b == a + 1`; chained instances
/// propagate a write across the whole chain in one atomic submission.
struct Link;

impl CompositeContract for Link {
    fn complete(&self, view: &UpdateView) -> ValuePatch {
        if view.is_submitted("a") {
            match view.submitted::<i64>("a") {
                Some(a) => ValuePatch::new().set("b", *a + 1),
                None => ValuePatch::new(),
            }
        } else if view.is_submitted("b") {
            match view.submitted::<i64>("b") {
                Some(b) => ValuePatch::new().set("a", *b - 1),
                None => ValuePatch::new(),
            }
        } else {
            ValuePatch::new()
        }
    }

    fn validate_primary(&self, primaries: &KeyValues) -> Result<(), String> {
        let a = primaries.get::<i64>("a").ok_or("a missing")?;
        let b = primaries.get::<i64>("b").ok_or("b missing")?;
        if *b == *a + 1 {
            Ok(())
        } else {
            Err(format!("b = {b} is not a + 1 = {}", *a + 1))
        }
    }
}

fn build_chain(coordinator: &Coordinator, length: usize) -> Vec<fuselink::Composite> {
    let links: Vec<_> = (0..length)
        .map(|_| {
            coordinator
                .register_composite(
                    CompositeSpec::new().primary("a", 0_i64).primary("b", 1_i64),
                    Arc::new(Link),
                )
                .unwrap()
        })
        .collect();

    for pair in links.windows(2) {
        let b = pair[0].primary_hook::<i64>("b").unwrap();
        let a = pair[1].primary_hook::<i64>("a").unwrap();
        b.join(&a).unwrap();
    }
    links
}

proptest! {
    #[test]
    fn chained_completion_converges(
        length in 2..8_usize,
        base in 100..1000_i64,
    ) {
        let coordinator = Coordinator::new();
        let links = build_chain(&coordinator, length);

        links[0]
            .submit(ValuePatch::new().set("a", base))
            .unwrap();

        for (offset, link) in links.iter().enumerate() {
            prop_assert_eq!(*link.value::<i64>("a").unwrap(), base + offset as i64);
            prop_assert_eq!(*link.value::<i64>("b").unwrap(), base + offset as i64 + 1);
        }
    }
}

#[test]
fn chain_outrunning_the_round_cap_is_divergent() {
    let coordinator = Coordinator::new();
    let links = build_chain(&coordinator, 70);

    let err = links[0]
        .submit(ValuePatch::new().set("a", 5000_i64))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CompletionDivergent);

    // Atomicity: the whole chain is untouched.
    for link in &links {
        assert!(*link.value::<i64>("a").unwrap() < 5000);
    }
}

#[test]
fn completion_conflict_between_two_composites_sharing_a_cell() {
    struct Mirror {
        delta: i64,
    }

    impl CompositeContract for Mirror {
        fn complete(&self, view: &UpdateView) -> ValuePatch {
            if view.is_submitted("src") {
                match view.submitted::<i64>("src") {
                    Some(src) => ValuePatch::new().set("dst", *src + self.delta),
                    None => ValuePatch::new(),
                }
            } else {
                ValuePatch::new()
            }
        }

        fn validate_primary(&self, _primaries: &KeyValues) -> Result<(), String> {
            Ok(())
        }
    }

    let coordinator = Coordinator::new();
    let plus_one = coordinator
        .register_composite(
            CompositeSpec::new().primary("src", 0_i64).primary("dst", 1_i64),
            Arc::new(Mirror { delta: 1 }),
        )
        .unwrap();
    let plus_two = coordinator
        .register_composite(
            CompositeSpec::new().primary("src", 0_i64).primary("dst", 2_i64),
            Arc::new(Mirror { delta: 2 }),
        )
        .unwrap();

    // Share both the source and destination cells across the composites.
    plus_one
        .primary_hook::<i64>("src")
        .unwrap()
        .join(&plus_two.primary_hook::<i64>("src").unwrap())
        .unwrap();
    plus_one
        .primary_hook::<i64>("dst")
        .unwrap()
        .join(&plus_two.primary_hook::<i64>("dst").unwrap())
        .unwrap();

    // A source write now makes the two completions demand different
    // values for the shared destination cell.
    let err = plus_one
        .submit(ValuePatch::new().set("src", 10_i64))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CompletionConflict);
}

//! Incremental evaluation through the two-phase step protocol.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use trickle::{
    Catch, DefinitionBuilder, InputChange, InputReceiver, KeyListNodeName, KeyedNodeName,
    NodeName, NodeOutcome, TrickleError, TrickleFailure, ValueId,
};

fn counter() -> Arc<AtomicU32> {
    Arc::new(AtomicU32::new(0))
}

// =============================================================================
// Plain nodes
// =============================================================================

#[test]
fn test_double_recomputes_only_on_change() {
    let a = NodeName::<i32>::new("a");
    let b = NodeName::<i32>::new("b");
    let calls = counter();

    let mut builder = DefinitionBuilder::new();
    let a_node = builder.create_input_node(&a).unwrap();
    let calls_clone = calls.clone();
    builder
        .create_node1(
            &b,
            &a_node.output(),
            move |a: &i32| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok(a * 2)
            },
            None,
        )
        .unwrap();
    let instance = builder.build().instantiate();

    assert_eq!(instance.set_input(&a, 3).unwrap(), 1);
    instance.complete_synchronously().unwrap();
    assert_eq!(instance.get_node_value(&b).unwrap(), 6);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Same value: no new timestamp, nothing to do
    assert_eq!(instance.set_input(&a, 3).unwrap(), 1);
    assert!(instance.get_next_steps().unwrap().is_empty());

    assert_eq!(instance.set_input(&a, 4).unwrap(), 2);
    instance.complete_synchronously().unwrap();
    assert_eq!(instance.get_node_value(&b).unwrap(), 8);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_missing_input_flows_downstream() {
    let a = NodeName::<i32>::new("a");
    let b = NodeName::<i32>::new("b");
    let c = NodeName::<i32>::new("c");

    let mut builder = DefinitionBuilder::new();
    let a_node = builder.create_input_node(&a).unwrap();
    let b_node = builder.create_input_node(&b).unwrap();
    builder
        .create_node2(&c, &a_node.output(), &b_node.output(), |a: &i32, b: &i32| Ok(a + b), None)
        .unwrap();
    let instance = builder.build().instantiate();

    instance.set_input(&b, 5).unwrap();
    // Failures are stored inline, without steps
    assert!(instance.get_next_steps().unwrap().is_empty());
    let outcome = instance.get_node_outcome(&c).unwrap();
    let failure = outcome.failure().unwrap();
    assert!(failure.errors().is_empty());
    assert_eq!(failure.missing_inputs().len(), 1);
    assert!(failure.missing_inputs().contains(&ValueId::nonkeyed(&a)));

    instance.set_input(&a, 5).unwrap();
    instance.complete_synchronously().unwrap();
    assert_eq!(instance.get_node_outcome(&c).unwrap(), NodeOutcome::Computed(10));
}

#[test]
fn test_catch_substitutes_for_failed_input() {
    let a = NodeName::<i32>::new("a");
    let thrower = NodeName::<i32>::new("thrower");
    let safe = NodeName::<i32>::new("safe");

    let mut builder = DefinitionBuilder::new();
    let a_node = builder.create_input_node(&a).unwrap();
    let thrower_node = builder
        .create_node1(
            &thrower,
            &a_node.output(),
            |_: &i32| -> anyhow::Result<i32> { anyhow::bail!("always fails") },
            None,
        )
        .unwrap();
    builder
        .create_node1(
            &safe,
            &thrower_node.output(),
            |v: &i32| Ok(*v),
            Some(Catch::new(|_: &TrickleFailure| Ok(0))),
        )
        .unwrap();
    let instance = builder.build().instantiate();

    instance.set_input(&a, 1).unwrap();
    instance.complete_synchronously().unwrap();
    assert_eq!(instance.get_node_value(&safe).unwrap(), 0);

    let outcome = instance.get_node_outcome(&thrower).unwrap();
    let failure = outcome.failure().unwrap();
    let error = &failure.errors()[&ValueId::nonkeyed(&thrower)];
    assert_eq!(error.to_string(), "always fails");
}

#[test]
fn test_catch_is_not_used_for_missing_inputs() {
    let a = NodeName::<i32>::new("a");
    let b = NodeName::<i32>::new("b");

    let mut builder = DefinitionBuilder::new();
    let a_node = builder.create_input_node(&a).unwrap();
    builder
        .create_node1(
            &b,
            &a_node.output(),
            |a: &i32| Ok(*a),
            Some(Catch::new(|_: &TrickleFailure| Ok(0))),
        )
        .unwrap();
    let instance = builder.build().instantiate();

    instance.complete_synchronously().unwrap();
    let outcome = instance.get_node_outcome(&b).unwrap();
    assert!(outcome
        .failure()
        .unwrap()
        .missing_inputs()
        .contains(&ValueId::nonkeyed(&a)));
}

#[test]
fn test_failures_of_several_inputs_are_combined() {
    let x = NodeName::<i32>::new("x");
    let y = NodeName::<i32>::new("y");
    let fx = NodeName::<i32>::new("fx");
    let fy = NodeName::<i32>::new("fy");
    let sum = NodeName::<i32>::new("sum");
    let caught = NodeName::<i32>::new("caught");
    let seen_errors = counter();

    let mut builder = DefinitionBuilder::new();
    let x_node = builder.create_input_node(&x).unwrap();
    let y_node = builder.create_input_node(&y).unwrap();
    let fx_node = builder
        .create_node1(
            &fx,
            &x_node.output(),
            |_: &i32| -> anyhow::Result<i32> { anyhow::bail!("x failed") },
            None,
        )
        .unwrap();
    let fy_node = builder
        .create_node1(
            &fy,
            &y_node.output(),
            |_: &i32| -> anyhow::Result<i32> { anyhow::bail!("y failed") },
            None,
        )
        .unwrap();
    builder
        .create_node2(&sum, &fx_node.output(), &fy_node.output(), |a: &i32, b: &i32| Ok(a + b), None)
        .unwrap();
    let seen_clone = seen_errors.clone();
    builder
        .create_node2(
            &caught,
            &fx_node.output(),
            &fy_node.output(),
            |a: &i32, b: &i32| Ok(a + b),
            Some(Catch::new(move |failure: &TrickleFailure| {
                seen_clone.store(failure.errors().len() as u32, Ordering::SeqCst);
                Ok(-1)
            })),
        )
        .unwrap();
    let instance = builder.build().instantiate();

    instance
        .set_inputs(vec![InputChange::set(&x, 1), InputChange::set(&y, 2)])
        .unwrap();
    instance.complete_synchronously().unwrap();

    let outcome = instance.get_node_outcome(&sum).unwrap();
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.errors().len(), 2);
    assert!(failure.errors().contains_key(&ValueId::nonkeyed(&fx)));
    assert!(failure.errors().contains_key(&ValueId::nonkeyed(&fy)));
    assert!(failure.to_string().contains("x failed"));
    assert!(failure.to_string().contains("y failed"));

    assert_eq!(instance.get_node_value(&caught).unwrap(), -1);
    assert_eq!(seen_errors.load(Ordering::SeqCst), 2);
}

#[test]
fn test_panics_are_captured_as_failures() {
    let a = NodeName::<i32>::new("a");
    let b = NodeName::<i32>::new("b");

    let mut builder = DefinitionBuilder::new();
    let a_node = builder.create_input_node(&a).unwrap();
    builder
        .create_node1(
            &b,
            &a_node.output(),
            |_: &i32| -> anyhow::Result<i32> { panic!("kaboom") },
            None,
        )
        .unwrap();
    let instance = builder.build().instantiate();

    instance.set_input(&a, 1).unwrap();
    instance.complete_synchronously().unwrap();
    match instance.get_node_value(&b) {
        Err(TrickleError::Failed { failure, .. }) => {
            assert!(failure.errors()[&ValueId::nonkeyed(&b)]
                .to_string()
                .contains("kaboom"));
        }
        other => panic!("expected a failure, got {:?}", other),
    }
}

#[test]
#[should_panic(expected = "kaboom")]
fn test_panics_propagate_when_not_caught() {
    let a = NodeName::<i32>::new("a");
    let b = NodeName::<i32>::new("b");

    let mut builder = DefinitionBuilder::new();
    let a_node = builder.create_input_node(&a).unwrap();
    builder
        .create_node1(
            &b,
            &a_node.output(),
            |_: &i32| -> anyhow::Result<i32> { panic!("kaboom") },
            None,
        )
        .unwrap();
    let instance = builder.build().instance_builder().catch_panics(false).build();

    instance.set_input(&a, 1).unwrap();
    let _ = instance.complete_synchronously();
}

#[test]
fn test_read_errors_explain_missing_values() {
    let a = NodeName::<i32>::new("a");
    let b = NodeName::<i32>::new("b");

    let mut builder = DefinitionBuilder::new();
    let a_node = builder.create_input_node(&a).unwrap();
    builder
        .create_node1(&b, &a_node.output(), |a: &i32| Ok(a + 1), None)
        .unwrap();
    let instance = builder.build().instantiate();

    assert!(matches!(
        instance.get_node_value(&b),
        Err(TrickleError::NotYetComputed { .. })
    ));
    assert!(matches!(
        instance.get_node_value(&a),
        Err(TrickleError::Failed { .. })
    ));
    assert_eq!(
        instance.get_node_outcome(&b).unwrap(),
        NodeOutcome::NotYetComputed
    );
}

// =============================================================================
// Timestamps
// =============================================================================

#[test]
fn test_idempotence_after_completion() {
    let a = NodeName::<i32>::new("a");
    let b = NodeName::<i32>::new("b");
    let c = NodeName::<i32>::new("c");

    let mut builder = DefinitionBuilder::new();
    let a_node = builder.create_input_node(&a).unwrap();
    let b_node = builder
        .create_node1(&b, &a_node.output(), |a: &i32| Ok(a + 1), None)
        .unwrap();
    builder
        .create_node2(&c, &a_node.output(), &b_node.output(), |a: &i32, b: &i32| Ok(a * b), None)
        .unwrap();
    let instance = builder.build().instantiate();

    instance.set_input(&a, 2).unwrap();
    instance.complete_synchronously().unwrap();
    assert!(instance.get_next_steps().unwrap().is_empty());
    assert_eq!(instance.get_node_value(&c).unwrap(), 6);

    // Every value converges on the newest timestamp among its inputs
    let a_time = instance.get_timestamp(&ValueId::nonkeyed(&a));
    assert_eq!(instance.get_timestamp(&ValueId::nonkeyed(&b)), a_time);
    assert_eq!(instance.get_timestamp(&ValueId::nonkeyed(&c)), a_time);
}

#[test]
fn test_out_of_order_results_keep_newest() {
    let a = NodeName::<i32>::new("a");
    let b = NodeName::<i32>::new("b");

    let mut builder = DefinitionBuilder::new();
    let a_node = builder.create_input_node(&a).unwrap();
    builder
        .create_node1(&b, &a_node.output(), |a: &i32| Ok(a + 1), None)
        .unwrap();
    let instance = builder.build().instantiate();

    instance.set_input(&a, 1).unwrap();
    let old_step = instance.get_next_steps().unwrap().pop().unwrap();
    instance.set_input(&a, 2).unwrap();
    let new_step = instance.get_next_steps().unwrap().pop().unwrap();
    assert_eq!(old_step.timestamp(), 1);
    assert_eq!(new_step.timestamp(), 2);

    let new_result = new_step.execute();
    let old_result = old_step.execute();
    assert_eq!(old_result.value::<i32>(), Some(&2));

    instance.report_result(new_result.clone()).unwrap();
    instance.report_result(old_result).unwrap();
    instance.report_result(new_result).unwrap();

    assert_eq!(instance.get_node_value(&b).unwrap(), 3);
    assert_eq!(instance.get_timestamp(&ValueId::nonkeyed(&b)), Some(2));
    assert!(instance.get_next_steps().unwrap().is_empty());
}

#[test]
fn test_partial_results_interleaved_with_input_changes() {
    let a = NodeName::<i64>::new("a");
    let b = NodeName::<i64>::new("b");
    let c = NodeName::<i64>::new("c");
    let d = NodeName::<i64>::new("d");
    let e = NodeName::<i64>::new("e");

    let mut builder = DefinitionBuilder::new();
    let a_node = builder.create_input_node(&a).unwrap();
    let b_node = builder.create_input_node(&b).unwrap();
    let c_node = builder
        .create_node2(
            &c,
            &a_node.output(),
            &b_node.output(),
            |a: &i64, b: &i64| Ok(a * 1000 + b * 100),
            None,
        )
        .unwrap();
    let d_node = builder
        .create_node2(
            &d,
            &a_node.output(),
            &b_node.output(),
            |a: &i64, b: &i64| Ok(a * 10 + b * 10),
            None,
        )
        .unwrap();
    builder
        .create_node2(&e, &c_node.output(), &d_node.output(), |c: &i64, d: &i64| Ok(c + d), None)
        .unwrap();
    let instance = builder.build().instantiate();

    instance
        .set_inputs(vec![InputChange::set(&a, 1), InputChange::set(&b, 1)])
        .unwrap();
    let steps = instance.get_next_steps().unwrap();
    assert_eq!(steps.len(), 2);
    let (c_steps, d_steps): (Vec<_>, Vec<_>) = steps
        .into_iter()
        .partition(|step| step.value_id() == &ValueId::nonkeyed(&c));

    for step in c_steps {
        instance.report_result(step.execute()).unwrap();
    }
    instance.set_input(&b, 2).unwrap();
    for step in d_steps {
        instance.report_result(step.execute()).unwrap();
    }
    assert_eq!(instance.get_node_value(&d).unwrap(), 20);

    // Both c and d are behind b now; e must wait for them
    let steps = instance.get_next_steps().unwrap();
    assert_eq!(steps.len(), 2);
    assert!(steps.iter().all(|step| step.timestamp() == 2));
    assert_eq!(instance.get_node_outcome(&e).unwrap(), NodeOutcome::NotYetComputed);

    instance.complete_synchronously().unwrap();
    assert_eq!(instance.get_node_value(&e).unwrap(), 1230);
    assert_eq!(instance.get_timestamp(&ValueId::nonkeyed(&e)), Some(2));
}

#[test]
fn test_steps_execute_on_worker_threads() {
    let keys = KeyListNodeName::<u32>::new("keys");
    let doubled = KeyedNodeName::<u32, u32>::new("doubled");

    let mut builder = DefinitionBuilder::new();
    let keys_node = builder.create_key_list_input_node(&keys).unwrap();
    builder
        .create_keyed_node0(&doubled, &keys_node, |k: &u32| Ok(k * 2), None)
        .unwrap();
    let instance = builder.build().instantiate();

    instance.set_keys(&keys, 0..8).unwrap();
    let steps = instance.get_next_steps().unwrap();
    assert_eq!(steps.len(), 8);

    let results = std::thread::scope(|scope| {
        let handles: Vec<_> = steps
            .into_iter()
            .map(|step| scope.spawn(move || step.execute()))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>()
    });
    for result in results {
        instance.report_result(result).unwrap();
    }

    instance.complete_synchronously().unwrap();
    assert_eq!(
        instance.get_node_value(&doubled).unwrap(),
        vec![0, 2, 4, 6, 8, 10, 12, 14]
    );
}

// =============================================================================
// Key lists
// =============================================================================

#[test]
fn test_key_list_writes_that_change_nothing() {
    let keys = KeyListNodeName::<i32>::new("keys");
    let mut builder = DefinitionBuilder::new();
    builder.create_key_list_input_node(&keys).unwrap();
    let instance = builder.build().instantiate();

    assert_eq!(instance.set_keys(&keys, [1, 2, 3]).unwrap(), 1);
    assert_eq!(instance.set_keys(&keys, [1, 2, 3]).unwrap(), 1);
    assert_eq!(instance.set_keys(&keys, [1, 2, 2, 3]).unwrap(), 1);
    assert_eq!(instance.add_key_input(&keys, 1).unwrap(), 1);
    assert_eq!(instance.remove_key_input(&keys, 9).unwrap(), 1);

    // Order is part of the contents
    assert_eq!(instance.set_keys(&keys, [3, 2, 1]).unwrap(), 2);
    assert_eq!(instance.get_node_value(&keys).unwrap(), vec![3, 2, 1]);
}

#[test]
fn test_edit_keys_and_many_keyed_inputs() {
    let keys = KeyListNodeName::<String>::new("keys");
    let values = KeyedNodeName::<String, i32>::new("values");

    let mut builder = DefinitionBuilder::new();
    let keys_node = builder.create_key_list_input_node(&keys).unwrap();
    builder.create_keyed_input_node(&values, &keys_node).unwrap();
    let instance = builder.build().instantiate();

    let s = |s: &str| s.to_string();
    instance
        .edit_keys(&keys, vec![s("a"), s("b"), s("c")], Vec::<String>::new())
        .unwrap();
    instance
        .set_keyed_inputs(&values, vec![(s("a"), 1), (s("b"), 2), (s("z"), 9)])
        .unwrap();
    instance.edit_keys(&keys, vec![s("d")], vec![s("b")]).unwrap();
    instance.complete_synchronously().unwrap();

    assert_eq!(
        instance.get_node_value(&keys).unwrap(),
        vec![s("a"), s("c"), s("d")]
    );
    assert_eq!(instance.get_node_value(&values.at(s("a"))).unwrap(), 1);
    assert_eq!(
        instance.get_node_outcome(&values.at(s("b"))).unwrap(),
        NodeOutcome::NoSuchKey
    );
    assert_eq!(
        instance.get_node_outcome(&values.at(s("z"))).unwrap(),
        NodeOutcome::NoSuchKey
    );

    let outcome = instance.get_node_outcome(&values).unwrap();
    let missing = outcome.failure().unwrap().missing_inputs();
    assert_eq!(missing.len(), 2);
    assert!(missing.contains(&ValueId::keyed(&values, s("c"))));
    assert!(missing.contains(&ValueId::keyed(&values, s("d"))));
}

#[test]
fn test_derived_key_list() {
    let n = NodeName::<u32>::new("n");
    let evens = KeyListNodeName::<u32>::new("evens");
    let squares = KeyedNodeName::<u32, u32>::new("squares");
    let calls = counter();

    let mut builder = DefinitionBuilder::new();
    let n_node = builder.create_input_node(&n).unwrap();
    let evens_node = builder
        .create_key_list_node1(
            &evens,
            &n_node.output(),
            |n: &u32| {
                if *n > 100 {
                    anyhow::bail!("too many keys");
                }
                Ok((0..*n).filter(|k| k % 2 == 0).collect())
            },
            None,
        )
        .unwrap();
    let calls_clone = calls.clone();
    builder
        .create_keyed_node0(
            &squares,
            &evens_node,
            move |k: &u32| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok(k * k)
            },
            None,
        )
        .unwrap();
    let instance = builder.build().instantiate();

    instance.set_input(&n, 5).unwrap();
    instance.complete_synchronously().unwrap();
    assert_eq!(instance.get_node_value(&evens).unwrap(), vec![0, 2, 4]);
    assert_eq!(instance.get_node_value(&squares).unwrap(), vec![0, 4, 16]);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // Shrinking prunes the removed key without recomputing the rest
    instance.set_input(&n, 3).unwrap();
    instance.complete_synchronously().unwrap();
    assert_eq!(instance.get_node_value(&squares).unwrap(), vec![0, 4]);
    assert_eq!(instance.get_timestamp(&ValueId::keyed(&squares, 4)), None);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // A failed key list has no members
    instance.set_input(&n, 200).unwrap();
    instance.complete_synchronously().unwrap();
    let outcome = instance.get_node_outcome(&evens).unwrap();
    let list_failure = outcome.failure().unwrap();
    assert!(list_failure
        .errors()
        .contains_key(&ValueId::full_key_list(&evens)));
    assert_eq!(
        instance.get_node_outcome(&squares).unwrap().failure(),
        Some(list_failure)
    );
    assert_eq!(
        instance.get_node_outcome(&squares.at(0)).unwrap().failure(),
        Some(list_failure)
    );
    assert_eq!(instance.get_timestamp(&ValueId::keyed(&squares, 0)), None);

    instance.set_input(&n, 3).unwrap();
    instance.complete_synchronously().unwrap();
    assert_eq!(instance.get_node_value(&squares).unwrap(), vec![0, 4]);
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

// =============================================================================
// Keyed nodes
// =============================================================================

#[test]
fn test_keyed_node_over_added_key() {
    let files = KeyListNodeName::<String>::new("files");
    let size = KeyedNodeName::<String, usize>::new("size");

    let mut builder = DefinitionBuilder::new();
    let files_node = builder.create_key_list_input_node(&files).unwrap();
    builder
        .create_keyed_node0(&size, &files_node, |file: &String| Ok(file.len()), None)
        .unwrap();
    let instance = builder.build().instantiate();

    instance.add_key_input(&files, "a".to_string()).unwrap();
    instance.complete_synchronously().unwrap();
    assert_eq!(
        instance.get_node_outcome(&size.at("a".to_string())).unwrap(),
        NodeOutcome::Computed(1)
    );
    assert_eq!(
        instance.get_node_outcome(&size).unwrap(),
        NodeOutcome::Computed(vec![1])
    );
}

#[test]
fn test_key_changes_schedule_only_new_keys() {
    let keys = KeyListNodeName::<i32>::new("keys");
    let doubled = KeyedNodeName::<i32, i32>::new("doubled");
    let calls = counter();

    let mut builder = DefinitionBuilder::new();
    let keys_node = builder.create_key_list_input_node(&keys).unwrap();
    let calls_clone = calls.clone();
    builder
        .create_keyed_node0(
            &doubled,
            &keys_node,
            move |k: &i32| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok(k * 2)
            },
            None,
        )
        .unwrap();
    let instance = builder.build().instantiate();

    instance.set_keys(&keys, [1, 2, 3]).unwrap();
    instance.complete_synchronously().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // Reordering only rebuilds the aggregate
    instance.set_keys(&keys, [3, 2, 1]).unwrap();
    assert!(instance.get_next_steps().unwrap().is_empty());
    assert_eq!(instance.get_node_value(&doubled).unwrap(), vec![6, 4, 2]);

    instance.add_key_input(&keys, 4).unwrap();
    let steps = instance.get_next_steps().unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].value_id(), &ValueId::keyed(&doubled, 4));
    for step in steps {
        instance.report_result(step.execute()).unwrap();
    }
    instance.complete_synchronously().unwrap();
    assert_eq!(instance.get_node_value(&doubled).unwrap(), vec![6, 4, 2, 8]);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[test]
fn test_removed_key_has_no_value() {
    let keys = KeyListNodeName::<i32>::new("keys");
    let doubled = KeyedNodeName::<i32, i32>::new("doubled");

    let mut builder = DefinitionBuilder::new();
    let keys_node = builder.create_key_list_input_node(&keys).unwrap();
    builder
        .create_keyed_node0(&doubled, &keys_node, |k: &i32| Ok(k * 2), None)
        .unwrap();
    let instance = builder.build().instantiate();

    instance.set_keys(&keys, [1, 2, 3]).unwrap();
    instance.complete_synchronously().unwrap();
    assert_eq!(instance.get_node_value(&doubled.at(2)).unwrap(), 4);

    instance.remove_key_input(&keys, 2).unwrap();
    assert_eq!(instance.get_timestamp(&ValueId::keyed(&doubled, 2)), None);
    assert_eq!(
        instance.get_node_outcome(&doubled.at(2)).unwrap(),
        NodeOutcome::NoSuchKey
    );
    assert!(matches!(
        instance.get_node_value(&doubled.at(2)),
        Err(TrickleError::NoSuchKey { .. })
    ));

    instance.complete_synchronously().unwrap();
    assert_eq!(instance.get_node_value(&doubled).unwrap(), vec![2, 6]);
}

#[test]
fn test_result_for_removed_key_is_dropped() {
    let keys = KeyListNodeName::<i32>::new("keys");
    let doubled = KeyedNodeName::<i32, i32>::new("doubled");

    let mut builder = DefinitionBuilder::new();
    let keys_node = builder.create_key_list_input_node(&keys).unwrap();
    builder
        .create_keyed_node0(&doubled, &keys_node, |k: &i32| Ok(k * 2), None)
        .unwrap();
    let instance = builder.build().instantiate();

    instance.set_keys(&keys, [1]).unwrap();
    let step = instance.get_next_steps().unwrap().pop().unwrap();
    let result = step.execute();

    instance.remove_key_input(&keys, 1).unwrap();
    instance.report_result(result.clone()).unwrap();
    assert_eq!(instance.get_timestamp(&ValueId::keyed(&doubled, 1)), None);

    // Re-adding the key does not revive the old computation
    instance.add_key_input(&keys, 1).unwrap();
    instance.report_result(result).unwrap();
    assert_eq!(
        instance.get_node_outcome(&doubled.at(1)).unwrap(),
        NodeOutcome::NotYetComputed
    );

    instance.complete_synchronously().unwrap();
    assert_eq!(instance.get_node_value(&doubled.at(1)).unwrap(), 2);
    assert_eq!(instance.get_timestamp(&ValueId::keyed(&doubled, 1)), Some(3));
}

#[test]
fn test_keyed_inputs_feed_keyed_nodes() {
    let items = KeyListNodeName::<String>::new("items");
    let prices = KeyedNodeName::<String, i64>::new("prices");
    let rate = NodeName::<i64>::new("rate");
    let taxed = KeyedNodeName::<String, i64>::new("taxed");
    let total = NodeName::<i64>::new("total");
    let calls = counter();

    let mut builder = DefinitionBuilder::new();
    let items_node = builder.create_key_list_input_node(&items).unwrap();
    let prices_node = builder.create_keyed_input_node(&prices, &items_node).unwrap();
    let rate_node = builder.create_input_node(&rate).unwrap();
    let calls_clone = calls.clone();
    let taxed_node = builder
        .create_keyed_node2(
            &taxed,
            &items_node,
            &prices_node.keyed_output(),
            &rate_node.output(),
            move |_: &String, price: &i64, rate: &i64| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok(price * rate)
            },
            None,
        )
        .unwrap();
    builder
        .create_node1(
            &total,
            &taxed_node.full_output(),
            |values: &Vec<i64>| Ok(values.iter().sum::<i64>()),
            None,
        )
        .unwrap();
    let instance = builder.build().instantiate();

    let s = |s: &str| s.to_string();
    instance
        .set_inputs(vec![
            InputChange::set_keys(&items, [s("apple"), s("pear")]),
            InputChange::set(&rate, 2),
        ])
        .unwrap();
    instance.set_keyed_input(&prices, s("apple"), 10).unwrap();
    instance.complete_synchronously().unwrap();

    // pear has no price yet
    let outcome = instance.get_node_outcome(&total).unwrap();
    let failure = outcome.failure().unwrap();
    assert!(failure
        .missing_inputs()
        .contains(&ValueId::keyed(&prices, s("pear"))));
    assert_eq!(instance.get_node_value(&taxed.at(s("apple"))).unwrap(), 20);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    instance.set_keyed_input(&prices, s("pear"), 5).unwrap();
    instance.complete_synchronously().unwrap();
    assert_eq!(instance.get_node_value(&total).unwrap(), 30);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // One price: one key recomputed
    instance.set_keyed_input(&prices, s("apple"), 20).unwrap();
    let steps = instance.get_next_steps().unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].value_id(), &ValueId::keyed(&taxed, s("apple")));
    for step in steps {
        instance.report_result(step.execute()).unwrap();
    }
    instance.complete_synchronously().unwrap();
    assert_eq!(instance.get_node_value(&total).unwrap(), 50);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // The rate: every key recomputed
    instance.set_input(&rate, 3).unwrap();
    instance.complete_synchronously().unwrap();
    assert_eq!(instance.get_node_value(&total).unwrap(), 75);
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[test]
fn test_keyed_catch() {
    let keys = KeyListNodeName::<i32>::new("keys");
    let values = KeyedNodeName::<i32, i32>::new("values");
    let checked = KeyedNodeName::<i32, i32>::new("checked");
    let safe = KeyedNodeName::<i32, i32>::new("safe");

    let mut builder = DefinitionBuilder::new();
    let keys_node = builder.create_key_list_input_node(&keys).unwrap();
    let values_node = builder.create_keyed_input_node(&values, &keys_node).unwrap();
    let checked_node = builder
        .create_keyed_node1(
            &checked,
            &keys_node,
            &values_node.keyed_output(),
            |_: &i32, v: &i32| {
                if *v < 0 {
                    anyhow::bail!("negative value {}", v);
                }
                Ok(*v)
            },
            None,
        )
        .unwrap();
    builder
        .create_keyed_node1(
            &safe,
            &keys_node,
            &checked_node.keyed_output(),
            |_: &i32, v: &i32| Ok(*v),
            Some(Catch::new(|_: &TrickleFailure| Ok(-1))),
        )
        .unwrap();
    let instance = builder.build().instantiate();

    instance.set_keys(&keys, [1, 2]).unwrap();
    instance
        .set_keyed_inputs(&values, [(1, 5), (2, -5)])
        .unwrap();
    instance.complete_synchronously().unwrap();

    assert_eq!(instance.get_node_value(&safe).unwrap(), vec![5, -1]);
    let outcome = instance.get_node_outcome(&checked).unwrap();
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.errors().len(), 1);
    assert_eq!(
        failure.errors()[&ValueId::keyed(&checked, 2)].to_string(),
        "negative value -5"
    );
}

#[test]
fn test_removed_keys_leave_membership_flags_and_stale_consumers() {
    let keys = KeyListNodeName::<i32>::new("keys");
    let doubled = KeyedNodeName::<i32, i32>::new("doubled");
    let count = NodeName::<usize>::new("count");

    let mut builder = DefinitionBuilder::new();
    let keys_node = builder.create_key_list_input_node(&keys).unwrap();
    let doubled_node = builder
        .create_keyed_node0(&doubled, &keys_node, |k: &i32| Ok(k * 2), None)
        .unwrap();
    builder
        .create_node1(
            &count,
            &doubled_node.full_output(),
            |values: &Vec<i32>| Ok(values.len()),
            None,
        )
        .unwrap();
    let instance = builder.build().instantiate();

    instance.set_keys(&keys, [1, 2]).unwrap();
    instance.complete_synchronously().unwrap();
    assert_eq!(instance.get_node_value(&count).unwrap(), 2);

    instance.remove_key_input(&keys, 2).unwrap();

    // The membership flag of a removed key is kept, not deleted
    assert_eq!(instance.get_timestamp(&ValueId::key_list_key(&keys, 2)), Some(2));
    // Only values keyed directly on the list are pruned; the aggregate and its consumers keep
    // their old values until they are recomputed
    assert_eq!(instance.get_timestamp(&ValueId::keyed(&doubled, 2)), None);
    assert_eq!(instance.get_node_value(&doubled).unwrap(), vec![2, 4]);
    assert_eq!(instance.get_node_value(&count).unwrap(), 2);

    instance.complete_synchronously().unwrap();
    assert_eq!(instance.get_node_value(&count).unwrap(), 1);
    assert_eq!(instance.get_timestamp(&ValueId::key_list_key(&keys, 2)), Some(2));
}

//! Property tests for commit, merge and fetch behavior.

use ctxgraph_core::{FetchRequest, Predicate, TransactionOptions, Value};
use ctxgraph_testkit::prelude::*;
use proptest::prelude::*;
use std::collections::BTreeMap;

fn expected_matches(batch: &[BTreeMap<String, Value>], request: &FetchRequest) -> usize {
    batch
        .iter()
        .filter(|fields| request.matches_fields(|f| fields.get(f).cloned()))
        .count()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn committed_fields_reach_main_unchanged(fields in page_fields_strategy()) {
        let harness = TestHarness::memory();
        let written = fields.clone();
        let id = on_worker(&harness, move |g| {
            g.run_transaction(TransactionOptions::new(), |txn| {
                let page = txn.context().insert("Page");
                for (name, value) in written {
                    page.set(&name, value);
                }
                Ok(page)
            })
            .unwrap()
            .permanent_id()
            .unwrap()
        });
        harness.wait_for_merges();

        let page = harness.main_context().object(id).unwrap().unwrap();
        for name in ["visits", "title"] {
            let expected = fields.get(name).cloned().unwrap_or(Value::Null);
            prop_assert_eq!(page.get(name), expected);
        }
    }

    #[test]
    fn fetch_agrees_before_and_after_commit(
        batch in page_batch_strategy(),
        threshold in visits_strategy(),
    ) {
        let harness = TestHarness::memory();
        let request = FetchRequest::new("Page")
            .filter(Predicate::GreaterThan("visits".into(), Value::Integer(threshold)));
        let expected = expected_matches(&batch, &request);

        let uncommitted = {
            let request = request.clone();
            on_worker(&harness, move |g| {
                g.run_transaction(TransactionOptions::new(), |txn| {
                    for fields in batch {
                        let page = txn.context().insert("Page");
                        for (name, value) in fields {
                            page.set(&name, value);
                        }
                    }
                    txn.context().count(&request)
                })
                .unwrap()
            })
        };
        harness.wait_for_merges();

        prop_assert_eq!(uncommitted, expected);
        prop_assert_eq!(harness.main_context().count(&request).unwrap(), expected);
        prop_assert_eq!(harness.main_context().fetch(&request).unwrap().len(), expected);
    }

    #[test]
    fn fetch_limit_caps_results(batch in page_batch_strategy(), limit in 0usize..10) {
        let harness = TestHarness::memory();
        let total = batch.len();
        on_worker(&harness, move |g| {
            g.run_transaction(TransactionOptions::new(), |txn| {
                for fields in batch {
                    let page = txn.context().insert("Page");
                    for (name, value) in fields {
                        page.set(&name, value);
                    }
                }
                Ok(())
            })
            .unwrap();
        });
        harness.wait_for_merges();

        let fetched = harness
            .main_context()
            .fetch(&FetchRequest::new("Page").limit(limit))
            .unwrap();
        prop_assert_eq!(fetched.len(), total.min(limit));
    }
}

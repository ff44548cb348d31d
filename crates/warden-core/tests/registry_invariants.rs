//! Property tests: registry invariants hold under arbitrary operation
//! sequences.

use std::collections::{BTreeSet, HashSet};

use proptest::prelude::*;

use warden_core::registry::{
    DomainId, DomainKind, DomainName, DomainRegistry, DomainSpec, RegistryError,
};

#[derive(Debug, Clone)]
enum Op {
    Add { name_idx: u8, kind: DomainKind, provider_idx: Option<u8>, template_idx: Option<u8> },
    Remove { idx: u8 },
    SetProvider { idx: u8, provider_idx: Option<u8> },
}

fn kind_strategy() -> impl Strategy<Value = DomainKind> {
    prop_oneof![
        Just(DomainKind::Template),
        Just(DomainKind::Application),
        Just(DomainKind::NetworkProvider),
        Just(DomainKind::Standalone),
    ]
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (
            0u8..24,
            kind_strategy(),
            proptest::option::of(0u8..24),
            proptest::option::of(0u8..24)
        )
            .prop_map(|(name_idx, kind, provider_idx, template_idx)| Op::Add {
                name_idx,
                kind,
                provider_idx,
                template_idx,
            }),
        (0u8..24).prop_map(|idx| Op::Remove { idx }),
        (0u8..24, proptest::option::of(0u8..24))
            .prop_map(|(idx, provider_idx)| Op::SetProvider { idx, provider_idx }),
    ]
}

/// Pick the nth live domain (admin excluded), if any.
fn nth_domain(registry: &DomainRegistry, idx: u8) -> Option<DomainId> {
    let ids: Vec<DomainId> = registry
        .iter()
        .map(|r| r.id)
        .filter(|id| !id.is_admin())
        .collect();
    if ids.is_empty() {
        None
    } else {
        Some(ids[idx as usize % ids.len()])
    }
}

fn check_invariants(registry: &DomainRegistry) {
    // unique ids and names
    let mut ids = HashSet::new();
    let mut names = HashSet::new();
    for record in registry.iter() {
        assert!(ids.insert(record.id), "duplicate id {}", record.id);
        assert!(
            names.insert(record.name.as_str().to_string()),
            "duplicate name {}",
            record.name
        );
    }

    for record in registry.iter() {
        // provider references resolve and point at network providers
        if let Some(provider) = record.network_provider {
            let target = registry.get(provider).expect("dangling provider");
            assert!(
                matches!(target.kind, DomainKind::NetworkProvider | DomainKind::Administrative),
                "provider {} of wrong kind",
                provider
            );
        }
        // template references resolve and point at templates
        if let Some(template) = record.template {
            let target = registry.get(template).expect("dangling template");
            assert_eq!(target.kind, DomainKind::Template);
        }

        // the provider relation is acyclic: walking up from any record
        // terminates without revisiting
        let mut seen = BTreeSet::new();
        let mut current = record.network_provider;
        seen.insert(record.id);
        while let Some(ancestor) = current {
            assert!(seen.insert(ancestor), "provider cycle through {ancestor}");
            current = registry.get(ancestor).expect("dangling ancestor").network_provider;
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn invariants_hold_under_arbitrary_sequences(ops in proptest::collection::vec(op_strategy(), 1..60)) {
        let mut registry = DomainRegistry::new();
        for (seq, op) in ops.into_iter().enumerate() {
            match op {
                Op::Add { name_idx, kind, provider_idx, template_idx } => {
                    let name = DomainName::new(format!("d{seq}-{name_idx}")).unwrap();
                    let mut spec = DomainSpec::new(name, kind);
                    if let Some(idx) = provider_idx {
                        if let Some(provider) = nth_domain(&registry, idx) {
                            spec = spec.with_network_provider(provider);
                        }
                    }
                    if let Some(idx) = template_idx {
                        if let Some(template) = nth_domain(&registry, idx) {
                            spec = spec.with_template(template);
                        }
                    }
                    // rejection is fine; partial application is not
                    let _ = registry.add(spec);
                }
                Op::Remove { idx } => {
                    if let Some(id) = nth_domain(&registry, idx) {
                        match registry.remove(id) {
                            Ok(()) => prop_assert!(registry.get(id).is_err()),
                            Err(RegistryError::StillReferenced { .. }) => {
                                prop_assert!(registry.get(id).is_ok());
                            }
                            Err(other) => prop_assert!(false, "unexpected error: {other}"),
                        }
                    }
                }
                Op::SetProvider { idx, provider_idx } => {
                    if let Some(id) = nth_domain(&registry, idx) {
                        let provider = provider_idx.and_then(|i| nth_domain(&registry, i));
                        let _ = registry.set_network_provider(id, provider);
                    }
                }
            }
            check_invariants(&registry);
        }
    }

    #[test]
    fn add_remove_round_trip_restores_snapshot(names in proptest::collection::vec(0u16..1000, 1..8)) {
        let mut registry = DomainRegistry::new();
        // a stable base domain so the registry is not empty
        registry
            .add(DomainSpec::new(DomainName::new("base").unwrap(), DomainKind::Application))
            .unwrap();
        let before = serde_json::to_string(&registry.snapshot()).unwrap();

        let mut added = Vec::new();
        for (i, n) in names.iter().enumerate() {
            let name = DomainName::new(format!("tmp{i}-{n}")).unwrap();
            added.push(registry.add(DomainSpec::new(name, DomainKind::Application)).unwrap());
        }
        for id in added {
            registry.remove(id).unwrap();
        }

        let after = serde_json::to_string(&registry.snapshot()).unwrap();
        prop_assert_eq!(before, after);
    }
}

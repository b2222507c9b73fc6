//! Resolver and solver properties over generated inputs.
//!
//! The fixed scenarios live next to the code; this file checks the
//! properties that should hold for *any* input: empty constraints always
//! satisfy, constraint lists are monotone, satisfying assignments actually
//! satisfy every clause, and plans respect the dependency partial order.

use lpm::prelude::*;
use lpm::solver::{CdclSolver, Cnf, Lit, SolverOptions};
use proptest::prelude::*;

proptest! {
    #[test]
    fn prop_empty_constraint_always_satisfied(
        major in 0u64..100, minor in 0u64..100, patch in 0u64..100
    ) {
        let version = format!("{major}.{minor}.{patch}");
        prop_assert!(satisfies(&version, "").unwrap());
    }

    #[test]
    fn prop_constraint_lists_are_monotone(
        major in 0u64..20, minor in 0u64..20,
        op_a in 0usize..5, a_major in 0u64..20,
        op_b in 0usize..5, b_major in 0u64..20,
    ) {
        let ops = [">=", "<=", "=", ">", "<"];
        let version = format!("{major}.{minor}");
        let c1 = format!("{}{a_major}.0", ops[op_a]);
        let c2 = format!("{}{b_major}.0", ops[op_b]);
        let joint = format!("{c1}, {c2}");
        // Adding a constraint never makes a version satisfy when it did not
        // before: joint satisfaction implies each part.
        if satisfies(&version, &joint).unwrap() {
            prop_assert!(satisfies(&version, &c1).unwrap());
            prop_assert!(satisfies(&version, &c2).unwrap());
        }
    }

    #[test]
    fn prop_version_compare_is_total_order(
        a_major in 0u64..10, a_minor in 0u64..10, a_patch in 0u64..10,
        b_major in 0u64..10, b_minor in 0u64..10, b_patch in 0u64..10,
    ) {
        let a = format!("{a_major}.{a_minor}.{a_patch}");
        let b = format!("{b_major}.{b_minor}.{b_patch}");
        let forward = lpm::deps::compare(&a, &b).unwrap();
        let backward = lpm::deps::compare(&b, &a).unwrap();
        prop_assert_eq!(forward, backward.reverse());
    }

    #[test]
    fn prop_sat_assignment_satisfies_all_clauses(
        clauses in proptest::collection::vec(
            proptest::collection::vec((1u32..=6, proptest::bool::ANY), 1..4),
            1..12,
        )
    ) {
        let mut cnf = Cnf::new();
        for v in 1..=6 {
            cnf.new_var(&format!("v{v}"));
        }
        let mut instance: Vec<Vec<Lit>> = Vec::new();
        for clause in &clauses {
            let lits: Vec<Lit> = clause
                .iter()
                .map(|&(v, positive)| if positive { v as Lit } else { -(v as Lit) })
                .collect();
            instance.push(lits.clone());
            cnf.add([lits]);
        }
        let mut solver = CdclSolver::new(cnf, SolverOptions::default());
        let result = solver.solve(&[]);
        if result.sat {
            for clause in &instance {
                let holds = clause.iter().any(|&lit| {
                    let value = result.value(lit.unsigned_abs());
                    if lit > 0 { value } else { !value }
                });
                prop_assert!(holds, "clause {clause:?} not satisfied");
            }
        }
    }

    #[test]
    fn prop_unsat_core_is_nonempty_on_forced_contradiction(v in 1u32..=4) {
        let mut cnf = Cnf::new();
        for i in 1..=4 {
            cnf.new_var(&format!("v{i}"));
        }
        let lit = v as Lit;
        cnf.add([vec![lit], vec![-lit]]);
        let mut solver = CdclSolver::new(cnf, SolverOptions::default());
        let result = solver.solve(&[]);
        prop_assert!(!result.sat);
        prop_assert!(!result.unsat_core.unwrap().is_empty());
    }
}

/// Build a small layered universe: each package requires one package from
/// the layer below.
fn layered_universe(layers: usize, width: usize) -> Universe {
    let mut universe = Universe::new();
    for layer in 0..layers {
        for slot in 0..width {
            let requires = if layer == 0 {
                Vec::new()
            } else {
                vec![format!("p{}x{slot}", layer - 1)]
            };
            universe.register_candidate(PkgMeta {
                name: format!("p{layer}x{slot}"),
                version: "1.0".into(),
                release: "1".into(),
                arch: "noarch".into(),
                requires,
                ..PkgMeta::default()
            });
        }
    }
    universe.sort_candidates();
    universe
}

#[test]
fn test_plan_respects_dependency_order_in_layers() {
    let universe = layered_universe(4, 3);
    let plan = solve(&["p3x0".into()], &universe, ResolveOptions::default()).expect("solve");
    let position: std::collections::HashMap<&str, usize> = plan
        .iter()
        .enumerate()
        .map(|(i, meta)| (meta.name.as_str(), i))
        .collect();
    // Every requirement precedes its requirer.
    for meta in &plan {
        for req in &meta.requires {
            let atom = lpm::deps::parse_atom(req).expect("atom");
            if let Some(&provider_pos) = position.get(atom.name.as_str()) {
                assert!(
                    provider_pos < position[meta.name.as_str()],
                    "{} must precede {}",
                    atom.name,
                    meta.name
                );
            }
        }
    }
}

#[test]
fn test_plan_set_satisfies_all_constraints() {
    // A small mixed universe with alternatives and a conflict.
    let mut universe = Universe::new();
    let mut reg = |name: &str, version: &str, requires: Vec<&str>, conflicts: Vec<&str>| {
        universe.register_candidate(PkgMeta {
            name: name.into(),
            version: version.into(),
            release: "1".into(),
            arch: "noarch".into(),
            requires: requires.into_iter().map(ToString::to_string).collect(),
            conflicts: conflicts.into_iter().map(ToString::to_string).collect(),
            ..PkgMeta::default()
        });
    };
    reg("app", "2.0", vec!["web | cli", "lib>=1.5"], vec![]);
    reg("web", "1.0", vec!["lib>=1.0"], vec!["cli"]);
    reg("cli", "1.0", vec![], vec!["web"]);
    reg("lib", "1.6", vec![], vec![]);
    reg("lib", "1.2", vec![], vec![]);
    universe.sort_candidates();

    let plan = solve(&["app".into()], &universe, ResolveOptions::default()).expect("solve");
    let by_name: std::collections::HashMap<&str, &PkgMeta> =
        plan.iter().map(|m| (m.name.as_str(), m)).collect();

    // At most one version per name.
    assert_eq!(by_name.len(), plan.len());
    // The version constraint picked a satisfying lib.
    assert!(satisfies(&by_name["lib"].version, ">=1.5").expect("satisfies"));
    // Exactly one of the conflicting alternatives.
    assert_eq!(
        usize::from(by_name.contains_key("web")) + usize::from(by_name.contains_key("cli")),
        1
    );
    // No conflicts inside the plan.
    for meta in &plan {
        for conflict in &meta.conflicts {
            let atom = lpm::deps::parse_atom(conflict).expect("atom");
            assert!(!by_name.contains_key(atom.name.as_str()));
        }
    }
}

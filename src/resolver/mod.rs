//! Dependency resolution: package universe, CNF encoding, plan extraction.
//!
//! The encoder introduces one boolean variable per candidate (interned as
//! `name==version`), emits at-most-one-per-name, requires, conflicts,
//! obsoletes, pin, hold, and goal clauses over the candidates reachable from
//! the goals, and biases the solver towards installed and newest versions.
//! A satisfying assignment is then pruned back to the packages actually
//! needed by the goals and ordered by dependency depth.

use crate::deps::parse::{Atom, DepExpr, parse_atom, parse_dep_expr};
use crate::deps::version::Version;
use crate::error::{LpmError, Result};
use crate::solver::{CdclSolver, Cnf, Lit, SolverOptions};
use crate::types::{InstalledRecord, PkgMeta, Pins, Repo};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// Options steering a single resolution.
#[derive(Clone, Copy, Debug, Default)]
pub struct ResolveOptions {
    /// Also encode `build_requires` edges (used by the build pipeline).
    pub include_build_requires: bool,
}

/// The candidate set a resolution runs against.
///
/// Candidates live in a flat arena; name and provider maps hold indices into
/// it, so requires/provides back-edges never form owning cycles.
#[derive(Debug, Default)]
pub struct Universe {
    /// Candidate arena.
    pub candidates: Vec<PkgMeta>,
    /// `name -> candidate indices`, newest and highest-priority first.
    pub by_name: HashMap<String, Vec<usize>>,
    /// `capability token -> candidate indices`.
    pub providers: HashMap<String, Vec<usize>>,
    /// Installed rows by name.
    pub installed: HashMap<String, InstalledRecord>,
    /// Holds and version preferences.
    pub pins: Pins,
    /// Repository tuning by repo name.
    pub repos: HashMap<String, Repo>,
}

impl Universe {
    /// Create an empty universe.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// What: Add a candidate to the arena and index it.
    ///
    /// Details:
    /// - Indexes the candidate under its name and every provide token
    ///   (unversioned capability plus the full `cap==ver` token).
    pub fn register_candidate(&mut self, meta: PkgMeta) -> usize {
        let idx = self.candidates.len();
        self.by_name.entry(meta.name.clone()).or_default().push(idx);
        for token in meta.provide_tokens() {
            let list = self.providers.entry(token).or_default();
            if !list.contains(&idx) {
                list.push(idx);
            }
        }
        self.candidates.push(meta);
        idx
    }

    /// What: Sort every per-name candidate list newest-first.
    ///
    /// Details:
    /// - Ties on version break on repo priority (lower wins), then release.
    /// - Call once after the last `register_candidate`.
    pub fn sort_candidates(&mut self) {
        let candidates = &self.candidates;
        for list in self.by_name.values_mut() {
            list.sort_by(|&a, &b| {
                let (ca, cb) = (&candidates[a], &candidates[b]);
                let va = Version::parse(&ca.version).unwrap_or_default();
                let vb = Version::parse(&cb.version).unwrap_or_default();
                vb.cmp(&va)
                    .then_with(|| ca.prio.cmp(&cb.prio))
                    .then_with(|| cb.release.cmp(&ca.release))
            });
        }
    }

    /// What: Collect the candidates satisfying an atom.
    ///
    /// Output:
    /// - Indices of candidates matching by name (version checked against the
    ///   atom) or by provide token (versioned provides checked against the
    ///   atom's constraint).
    pub fn providers_for_atom(&self, atom: &Atom) -> Result<Vec<usize>> {
        let mut out: BTreeSet<usize> = BTreeSet::new();
        if let Some(list) = self.by_name.get(&atom.name) {
            for &idx in list {
                if atom.matches_version(&self.candidates[idx].version)? {
                    out.insert(idx);
                }
            }
        }
        if let Some(list) = self.providers.get(&atom.name) {
            for &idx in list {
                let meta = &self.candidates[idx];
                if meta.name == atom.name {
                    continue;
                }
                if atom.op.is_empty() {
                    out.insert(idx);
                    continue;
                }
                for provide in &meta.provides {
                    if let Some((cap, ver)) = provide.split_once("==")
                        && cap.trim() == atom.name
                        && atom.matches_version(ver.trim())?
                    {
                        out.insert(idx);
                        break;
                    }
                }
            }
        }
        Ok(out.into_iter().collect())
    }

    /// Index of the candidate matching the installed row of `name`, if any.
    #[must_use]
    pub fn installed_candidate(&self, name: &str) -> Option<usize> {
        let record = self.installed.get(name)?;
        self.by_name.get(name)?.iter().copied().find(|&idx| {
            let meta = &self.candidates[idx];
            meta.version == record.version
                && (meta.release == record.release || record.release.is_empty())
        })
    }
}

/// Turn a dependency expression into clauses of atoms (AND of ORs).
fn expr_clauses(expr: &DepExpr) -> Vec<Vec<Atom>> {
    match expr {
        DepExpr::Atom(atom) => vec![vec![atom.clone()]],
        DepExpr::And(parts) => parts.iter().flat_map(expr_clauses).collect(),
        DepExpr::Or(parts) => {
            // Distribute OR over the branches' clause lists. Real-world
            // dependency expressions keep this tiny.
            let mut acc: Vec<Vec<Atom>> = vec![Vec::new()];
            for part in parts {
                let part_clauses = expr_clauses(part);
                let mut next = Vec::new();
                for prefix in &acc {
                    for clause in &part_clauses {
                        let mut merged = prefix.clone();
                        merged.extend(clause.iter().cloned());
                        next.push(merged);
                    }
                }
                acc = next;
            }
            acc
        }
    }
}

fn clause_display(atoms: &[Atom]) -> String {
    atoms
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" | ")
}

struct Encoder<'u> {
    universe: &'u Universe,
    cnf: Cnf,
    vars: HashMap<usize, Lit>,
    opts: ResolveOptions,
    reachable: Vec<usize>,
}

impl<'u> Encoder<'u> {
    fn new(universe: &'u Universe, opts: ResolveOptions) -> Self {
        Self {
            universe,
            cnf: Cnf::new(),
            vars: HashMap::new(),
            opts,
            reachable: Vec::new(),
        }
    }

    fn var_for(&mut self, idx: usize) -> Lit {
        if let Some(&lit) = self.vars.get(&idx) {
            return lit;
        }
        let ident = self.universe.candidates[idx].ident();
        let lit = self.cnf.new_var(&ident) as Lit;
        self.vars.insert(idx, lit);
        lit
    }

    fn requires_of(&self, idx: usize) -> Vec<String> {
        let meta = &self.universe.candidates[idx];
        let mut reqs = meta.requires.clone();
        if self.opts.include_build_requires {
            reqs.extend(meta.build_requires.iter().cloned());
        }
        reqs
    }

    /// Breadth-first discovery of every candidate the goals can pull in.
    /// A goal provider whose requires has no provider at all fails fast;
    /// a transitively discovered alternative with a dead dependency merely
    /// becomes uninstallable (its requires clause degenerates to `¬x`).
    fn discover(&mut self, roots: &[usize]) -> Result<()> {
        let root_set: HashSet<usize> = roots.iter().copied().collect();
        let mut seen: HashSet<usize> = HashSet::new();
        let mut queue: VecDeque<usize> = VecDeque::new();
        for &idx in roots {
            if seen.insert(idx) {
                queue.push_back(idx);
            }
        }
        while let Some(idx) = queue.pop_front() {
            self.reachable.push(idx);
            // Alternatives of the same name participate in at-most-one
            // clauses, so they must be discovered too.
            let name = self.universe.candidates[idx].name.clone();
            if let Some(list) = self.universe.by_name.get(&name) {
                for &alt in list {
                    if seen.insert(alt) {
                        queue.push_back(alt);
                    }
                }
            }
            let context = {
                let meta = &self.universe.candidates[idx];
                format!("{}-{}", meta.name, meta.version)
            };
            for req in self.requires_of(idx) {
                let expr = parse_dep_expr(&req)?;
                for clause in expr_clauses(&expr) {
                    let mut provider_indices = Vec::new();
                    for atom in &clause {
                        provider_indices.extend(self.universe.providers_for_atom(atom)?);
                    }
                    if provider_indices.is_empty() {
                        if root_set.contains(&idx) {
                            return Err(LpmError::NoProvider {
                                atom: clause_display(&clause),
                                context,
                            });
                        }
                        tracing::debug!(
                            "{context} is uninstallable: no provider for '{}'",
                            clause_display(&clause)
                        );
                        continue;
                    }
                    for provider in provider_indices {
                        if seen.insert(provider) {
                            queue.push_back(provider);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn encode_at_most_one(&mut self) {
        let mut by_name: HashMap<&str, Vec<usize>> = HashMap::new();
        for &idx in &self.reachable {
            by_name
                .entry(self.universe.candidates[idx].name.as_str())
                .or_default()
                .push(idx);
        }
        let groups: Vec<Vec<usize>> = by_name.into_values().collect();
        for group in groups {
            for (i, &a) in group.iter().enumerate() {
                for &b in &group[i + 1..] {
                    let (la, lb) = (self.var_for(a), self.var_for(b));
                    self.cnf.add([vec![-la, -lb]]);
                }
            }
        }
    }

    fn encode_requires(&mut self) -> Result<()> {
        for idx in self.reachable.clone() {
            let self_lit = self.var_for(idx);
            for req in self.requires_of(idx) {
                let expr = parse_dep_expr(&req)?;
                for clause in expr_clauses(&expr) {
                    let mut lits = vec![-self_lit];
                    let mut providers = BTreeSet::new();
                    for atom in &clause {
                        providers.extend(self.universe.providers_for_atom(atom)?);
                    }
                    let self_satisfies = providers.contains(&idx);
                    for provider in providers {
                        if provider != idx {
                            lits.push(self.var_for(provider));
                        }
                    }
                    if lits.len() > 1 {
                        self.cnf.add([lits]);
                    } else if !self_satisfies {
                        // Dead dependency: the candidate cannot be chosen.
                        self.cnf.add([lits]);
                    }
                }
            }
        }
        Ok(())
    }

    fn encode_conflicts(&mut self) -> Result<()> {
        for idx in self.reachable.clone() {
            let meta = &self.universe.candidates[idx];
            let exclusions: Vec<String> = meta
                .conflicts
                .iter()
                .chain(meta.obsoletes.iter())
                .cloned()
                .collect();
            let self_lit = self.var_for(idx);
            for text in exclusions {
                let atom = parse_atom(&text)?;
                for other in self.universe.providers_for_atom(&atom)? {
                    if other == idx {
                        continue;
                    }
                    // Exclusions only bind candidates in the problem.
                    if self.vars.contains_key(&other)
                        || self.reachable.contains(&other)
                    {
                        let other_lit = self.var_for(other);
                        self.cnf.add([vec![-self_lit, -other_lit]]);
                    }
                }
            }
        }
        Ok(())
    }

    fn encode_pins(&mut self, prefer_true: &mut HashSet<u32>) -> Result<()> {
        let prefer: Vec<(String, String)> = self
            .universe
            .pins
            .prefer
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (name, constraint) in prefer {
            let Some(list) = self.universe.by_name.get(&name) else {
                continue;
            };
            for &idx in list {
                if !self.reachable.contains(&idx) {
                    continue;
                }
                let lit = self.var_for(idx);
                if crate::deps::satisfies(&self.universe.candidates[idx].version, &constraint)? {
                    prefer_true.insert(lit.unsigned_abs());
                } else {
                    self.cnf.add([vec![-lit]]);
                }
            }
        }
        for name in self.universe.pins.hold.clone() {
            let Some(record) = self.universe.installed.get(&name) else {
                continue;
            };
            let (held_version, held_release) = (record.version.clone(), record.release.clone());
            let Some(list) = self.universe.by_name.get(&name) else {
                continue;
            };
            for &idx in list {
                if !self.reachable.contains(&idx) {
                    continue;
                }
                let meta = &self.universe.candidates[idx];
                let keeps = meta.version == held_version
                    && (meta.release == held_release || held_release.is_empty());
                if !keeps {
                    let lit = self.var_for(idx);
                    self.cnf.add([vec![-lit]]);
                }
            }
        }
        Ok(())
    }

    fn encode_goals(&mut self, goals: &[String]) -> Result<()> {
        for goal in goals {
            let expr = parse_dep_expr(goal)?;
            for clause in expr_clauses(&expr) {
                let mut providers = BTreeSet::new();
                for atom in &clause {
                    providers.extend(self.universe.providers_for_atom(atom)?);
                }
                if providers.is_empty() {
                    return Err(LpmError::NoProvider {
                        atom: clause_display(&clause),
                        context: "goals".to_string(),
                    });
                }
                let lits: Vec<Lit> = providers.into_iter().map(|idx| self.var_for(idx)).collect();
                self.cnf.add([lits]);
            }
        }
        Ok(())
    }

    /// Phase and activity hints: installed and newest-per-name branch true
    /// first, other alternatives false first; repo bias and decay feed the
    /// VSIDS activity of each candidate's variable.
    fn heuristics(&mut self, prefer_true: &mut HashSet<u32>) -> SolverOptions {
        let mut prefer_false = HashSet::new();
        let mut bias = HashMap::new();
        let mut decay_map = HashMap::new();

        let mut names: HashSet<&str> = HashSet::new();
        for &idx in &self.reachable {
            names.insert(self.universe.candidates[idx].name.as_str());
        }
        let names: Vec<String> = names.into_iter().map(ToString::to_string).collect();
        for name in names {
            let installed_idx = self.universe.installed_candidate(&name);
            let newest_idx = self
                .universe
                .by_name
                .get(&name)
                .and_then(|list| list.first().copied());
            if let Some(list) = self.universe.by_name.get(&name) {
                for &idx in list {
                    if !self.vars.contains_key(&idx) {
                        continue;
                    }
                    let var = self.var_for(idx).unsigned_abs();
                    if Some(idx) == installed_idx || Some(idx) == newest_idx {
                        prefer_true.insert(var);
                        // Installed outranks newest in branch order so a held
                        // system is not upgraded just because a newer
                        // candidate exists.
                        let boost = if Some(idx) == installed_idx { 2.0 } else { 1.0 };
                        *bias.entry(var).or_insert(0.0) += boost;
                    } else {
                        prefer_false.insert(var);
                    }
                }
            }
        }
        for (&idx, &lit) in &self.vars {
            let meta = &self.universe.candidates[idx];
            if let Some(repo) = self.universe.repos.get(&meta.repo) {
                if let Some(value) = repo.bias {
                    *bias.entry(lit.unsigned_abs()).or_insert(0.0) += value;
                }
                if let Some(value) = repo.decay {
                    decay_map.insert(lit.unsigned_abs(), value);
                }
            }
        }
        // prefer_true wins over prefer_false for the same variable.
        for var in prefer_true.iter() {
            prefer_false.remove(var);
        }
        SolverOptions {
            prefer_true: prefer_true.clone(),
            prefer_false,
            bias,
            decay_map,
            ..SolverOptions::default()
        }
    }
}

/// What: Resolve goals against a universe into an ordered install plan.
///
/// Inputs:
/// - `goals`: Dependency expressions to satisfy (package names, atoms with
///   version clauses, OR alternatives).
/// - `universe`: Candidate set, installed rows, pins, and repo tuning.
/// - `opts`: Resolution options.
///
/// Output:
/// - The chosen candidates ordered so that providers precede requirers
///   (depth metric, name tie-break).
///
/// # Errors
///
/// - `NoProvider` when a goal or a reachable candidate's requires has no
///   provider at all.
/// - `Unsatisfiable` with the minimized core mapped to package names when
///   the constraints admit no assignment.
///
/// # Example
///
/// ```
/// use lpm::resolver::{ResolveOptions, Universe, solve};
/// use lpm::types::PkgMeta;
///
/// let mut universe = Universe::new();
/// universe.register_candidate(PkgMeta {
///     name: "a".into(),
///     version: "1.0".into(),
///     requires: vec!["b>=1".into()],
///     ..PkgMeta::default()
/// });
/// universe.register_candidate(PkgMeta {
///     name: "b".into(),
///     version: "1.0".into(),
///     ..PkgMeta::default()
/// });
/// universe.sort_candidates();
/// let plan = solve(&["a".into()], &universe, ResolveOptions::default()).unwrap();
/// let names: Vec<&str> = plan.iter().map(|p| p.name.as_str()).collect();
/// assert_eq!(names, vec!["b", "a"]);
/// ```
pub fn solve(goals: &[String], universe: &Universe, opts: ResolveOptions) -> Result<Vec<PkgMeta>> {
    let mut encoder = Encoder::new(universe, opts);

    // Roots: every provider of every goal clause.
    let mut roots = Vec::new();
    for goal in goals {
        let expr = parse_dep_expr(goal)?;
        for clause in expr_clauses(&expr) {
            let mut providers = BTreeSet::new();
            for atom in &clause {
                providers.extend(universe.providers_for_atom(atom)?);
            }
            if providers.is_empty() {
                return Err(LpmError::NoProvider {
                    atom: clause_display(&clause),
                    context: "goals".to_string(),
                });
            }
            roots.extend(providers);
        }
    }

    encoder.discover(&roots)?;
    encoder.encode_at_most_one();
    encoder.encode_requires()?;
    encoder.encode_conflicts()?;
    let mut prefer_true = HashSet::new();
    encoder.encode_pins(&mut prefer_true)?;
    encoder.encode_goals(goals)?;
    let solver_opts = encoder.heuristics(&mut prefer_true);

    let Encoder { cnf, vars, .. } = encoder;
    let mut solver = CdclSolver::new(cnf, solver_opts);
    let result = solver.solve(&[]);
    tracing::debug!(
        conflicts = solver.last_conflicts,
        restarts = solver.last_restarts,
        "solver finished"
    );
    if !result.sat {
        let core = result.unsat_core.unwrap_or_default();
        let mut names: Vec<String> = core
            .iter()
            .filter_map(|&lit| solver.cnf().name(lit.unsigned_abs()))
            .map(|ident| ident.split("==").next().unwrap_or(ident).to_string())
            .collect();
        names.sort();
        names.dedup();
        return Err(LpmError::Unsatisfiable { core: names });
    }

    // True-assigned candidate per name (at-most-one guarantees uniqueness).
    let mut chosen: HashMap<String, usize> = HashMap::new();
    for (&idx, &lit) in &vars {
        if result.value(lit.unsigned_abs()) {
            chosen.insert(universe.candidates[idx].name.clone(), idx);
        }
    }

    extract_plan(goals, universe, opts, &chosen)
}

/// Walk from the goals through the chosen assignment, keeping only the
/// packages actually needed, then order by dependency depth.
fn extract_plan(
    goals: &[String],
    universe: &Universe,
    opts: ResolveOptions,
    chosen: &HashMap<String, usize>,
) -> Result<Vec<PkgMeta>> {
    let pick = |atoms: &[Atom]| -> Result<Option<usize>> {
        let mut best: Option<usize> = None;
        for atom in atoms {
            for idx in universe.providers_for_atom(atom)? {
                let name = &universe.candidates[idx].name;
                if chosen.get(name) == Some(&idx) {
                    let installed = universe.installed_candidate(name) == Some(idx);
                    if installed {
                        return Ok(Some(idx));
                    }
                    best.get_or_insert(idx);
                }
            }
        }
        Ok(best)
    };

    let mut selected: Vec<usize> = Vec::new();
    let mut selected_set: HashSet<usize> = HashSet::new();
    let mut queue: VecDeque<usize> = VecDeque::new();

    for goal in goals {
        let expr = parse_dep_expr(goal)?;
        for clause in expr_clauses(&expr) {
            if let Some(idx) = pick(&clause)?
                && selected_set.insert(idx)
            {
                queue.push_back(idx);
            }
        }
    }

    while let Some(idx) = queue.pop_front() {
        selected.push(idx);
        let meta = &universe.candidates[idx];
        let mut reqs = meta.requires.clone();
        if opts.include_build_requires {
            reqs.extend(meta.build_requires.iter().cloned());
        }
        for req in reqs {
            let expr = parse_dep_expr(&req)?;
            for clause in expr_clauses(&expr) {
                if let Some(dep) = pick(&clause)?
                    && dep != idx
                    && selected_set.insert(dep)
                {
                    queue.push_back(dep);
                }
            }
        }
    }

    // Depth metric: providers sort before requirers; cycle members share the
    // depth reached when the cycle is first re-entered.
    let mut depth: HashMap<usize, u64> = HashMap::new();
    fn depth_of(
        idx: usize,
        universe: &Universe,
        opts: ResolveOptions,
        selected: &HashSet<usize>,
        depth: &mut HashMap<usize, u64>,
        visiting: &mut HashSet<usize>,
    ) -> Result<u64> {
        if let Some(&d) = depth.get(&idx) {
            return Ok(d);
        }
        if !visiting.insert(idx) {
            return Ok(0);
        }
        let meta = &universe.candidates[idx];
        let mut reqs = meta.requires.clone();
        if opts.include_build_requires {
            reqs.extend(meta.build_requires.iter().cloned());
        }
        let mut max_dep = 0u64;
        for req in reqs {
            let expr = parse_dep_expr(&req)?;
            for clause in expr_clauses(&expr) {
                for atom in clause {
                    for dep in universe.providers_for_atom(&atom)? {
                        if dep != idx && selected.contains(&dep) {
                            let d = depth_of(dep, universe, opts, selected, depth, visiting)?;
                            max_dep = max_dep.max(d);
                        }
                    }
                }
            }
        }
        visiting.remove(&idx);
        let d = 1 + max_dep;
        depth.insert(idx, d);
        Ok(d)
    }

    let selected_lookup: HashSet<usize> = selected.iter().copied().collect();
    for &idx in &selected {
        let mut visiting = HashSet::new();
        depth_of(idx, universe, opts, &selected_lookup, &mut depth, &mut visiting)?;
    }

    let mut plan = selected;
    plan.sort_by(|&a, &b| {
        let da = depth.get(&a).copied().unwrap_or(0);
        let db = depth.get(&b).copied().unwrap_or(0);
        da.cmp(&db)
            .then_with(|| universe.candidates[a].name.cmp(&universe.candidates[b].name))
    });
    Ok(plan.into_iter().map(|idx| universe.candidates[idx].clone()).collect())
}

//! Conflict-driven clause learning search.
//!
//! The procedure is the classic loop: propagate with watched literals,
//! branch on the highest-activity unassigned variable, analyze conflicts to
//! a 1-UIP learnt clause, backtrack non-chronologically, reduce the learnt
//! database by LBD when it outgrows the budget, and restart on the Luby
//! schedule. Variable activity decays lazily: a global step counter advances
//! on every conflict and a variable's activity is rescaled by
//! `decay^(steps - last_seen)` the next time it is touched, so per-variable
//! decay overrides cost nothing on untouched variables.

use crate::solver::cnf::{Cnf, Lit, Var, lit_var};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

/// Activity ceiling triggering a global rescale.
const RESCALE_LIMIT: f64 = 1e100;

/// Rescale factor applied to every activity at the ceiling.
const RESCALE_FACTOR: f64 = 1e-100;

/// What: Compute the i-th value of the Luby sequence (1-based).
///
/// Details:
/// - 1, 1, 2, 1, 1, 2, 4, 1, 1, 2, 1, 1, 2, 4, 8, ...
#[must_use]
pub fn luby(i: u64) -> u64 {
    let mut i = i;
    loop {
        let mut k = 1u32;
        while (1u64 << k) - 1 < i {
            k += 1;
        }
        if i == (1 << k) - 1 {
            return 1 << (k - 1);
        }
        i -= (1 << (k - 1)) - 1;
    }
}

/// Tuning knobs and search hints handed over by the resolver encoder.
#[derive(Clone, Debug)]
pub struct SolverOptions {
    /// Variables branched `true` first when no phase has been saved.
    pub prefer_true: HashSet<Var>,
    /// Variables branched `false` first when no phase has been saved.
    pub prefer_false: HashSet<Var>,
    /// Initial activity per variable.
    pub bias: HashMap<Var, f64>,
    /// Per-variable decay overrides (falls back to `var_decay`).
    pub decay_map: HashMap<Var, f64>,
    /// Default variable activity decay per conflict.
    pub var_decay: f64,
    /// Clause activity decay per conflict.
    pub cla_decay: f64,
    /// Learnt-clause budget before the database is reduced.
    pub max_learnts: usize,
    /// Luby restart unit: the i-th restart fires after `luby(i) * unit`
    /// conflicts.
    pub restart_unit: u64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            prefer_true: HashSet::new(),
            prefer_false: HashSet::new(),
            bias: HashMap::new(),
            decay_map: HashMap::new(),
            var_decay: 0.95,
            cla_decay: 0.999,
            max_learnts: 200,
            restart_unit: 100,
        }
    }
}

/// Outcome of a [`CdclSolver::solve`] call.
#[derive(Clone, Debug)]
pub struct SatResult {
    /// Whether a satisfying assignment was found.
    pub sat: bool,
    /// Assignment per variable, indexed 1-based (index 0 unused).
    /// Unassigned variables default to `false`.
    pub assign: Vec<bool>,
    /// Minimized root-level conflict, present when `sat` is false.
    pub unsat_core: Option<Vec<Lit>>,
}

impl SatResult {
    /// Value of a variable in the assignment.
    #[must_use]
    pub fn value(&self, var: Var) -> bool {
        self.assign.get(var as usize).copied().unwrap_or(false)
    }
}

#[derive(Debug)]
struct HeapEntry {
    activity: f64,
    seq: u64,
    var: Var,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap on activity; FIFO on ties.
        self.activity
            .total_cmp(&other.activity)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Conflict-driven clause learning SAT solver over a [`Cnf`].
///
/// Activity and saved phases persist across `solve` calls, so re-solving a
/// grown instance is cheaper than solving it cold (learned clauses stay in
/// the [`Cnf`] as well).
pub struct CdclSolver {
    cnf: Cnf,
    opts: SolverOptions,

    // Persistent heuristic state.
    var_activity: HashMap<Var, f64>,
    saved_phase: HashMap<Var, bool>,
    var_inc: f64,
    cla_inc: f64,
    decay_steps: u64,
    last_decay_step: HashMap<Var, u64>,

    // Search state, rebuilt per solve.
    assigns: Vec<Option<bool>>,
    levels: Vec<u32>,
    reason: Vec<Option<usize>>,
    trail: Vec<Lit>,
    trail_lim: Vec<usize>,
    queue: VecDeque<Lit>,
    heap: BinaryHeap<HeapEntry>,
    heap_seq: u64,

    /// Conflicts seen by the most recent `solve` call.
    pub last_conflicts: u64,
    /// Restarts performed by the most recent `solve` call.
    pub last_restarts: u64,
}

impl CdclSolver {
    /// Create a solver over `cnf` with the given options.
    #[must_use]
    pub fn new(cnf: Cnf, opts: SolverOptions) -> Self {
        let var_activity = opts.bias.clone();
        Self {
            cnf,
            opts,
            var_activity,
            saved_phase: HashMap::new(),
            var_inc: 1.0,
            cla_inc: 1.0,
            decay_steps: 0,
            last_decay_step: HashMap::new(),
            assigns: Vec::new(),
            levels: Vec::new(),
            reason: Vec::new(),
            trail: Vec::new(),
            trail_lim: Vec::new(),
            queue: VecDeque::new(),
            heap: BinaryHeap::new(),
            heap_seq: 0,
            last_conflicts: 0,
            last_restarts: 0,
        }
    }

    /// The underlying CNF (for mapping variables back to names).
    #[must_use]
    pub fn cnf(&self) -> &Cnf {
        &self.cnf
    }

    fn current_level(&self) -> u32 {
        self.trail_lim.len() as u32
    }

    fn value(&self, lit: Lit) -> Option<bool> {
        self.assigns[lit_var(lit) as usize].map(|val| if lit > 0 { val } else { !val })
    }

    /// Apply pending lazy decay to a variable and return its activity.
    fn normalize_var(&mut self, v: Var) -> f64 {
        let last = *self.last_decay_step.entry(v).or_insert(self.decay_steps);
        let pending = self.decay_steps - last;
        if pending > 0 {
            let factor = self
                .opts
                .decay_map
                .get(&v)
                .copied()
                .unwrap_or(self.opts.var_decay);
            let entry = self.var_activity.entry(v).or_insert(0.0);
            *entry *= factor.powi(pending as i32);
            self.last_decay_step.insert(v, self.decay_steps);
        }
        self.var_activity.get(&v).copied().unwrap_or(0.0)
    }

    fn push_var(&mut self, v: Var, activity: Option<f64>) {
        if self.assigns[v as usize].is_some() {
            return;
        }
        let activity = activity.unwrap_or_else(|| self.normalize_var(v));
        self.heap_seq += 1;
        self.heap.push(HeapEntry { activity, seq: self.heap_seq, var: v });
    }

    fn bump_var(&mut self, v: Var) {
        self.normalize_var(v);
        let inc = self.var_inc;
        let value = {
            let entry = self.var_activity.entry(v).or_insert(0.0);
            *entry += inc;
            *entry
        };
        if value > RESCALE_LIMIT {
            let vars: Vec<Var> = self.var_activity.keys().copied().collect();
            for k in vars {
                self.normalize_var(k);
                if let Some(a) = self.var_activity.get_mut(&k) {
                    *a *= RESCALE_FACTOR;
                }
            }
            self.var_inc *= RESCALE_FACTOR;
        }
        if self.assigns[v as usize].is_none() {
            let activity = self.var_activity.get(&v).copied().unwrap_or(0.0);
            self.push_var(v, Some(activity));
        }
    }

    fn decay_var_activity(&mut self) {
        self.var_inc /= self.opts.var_decay;
        self.decay_steps += 1;
    }

    fn bump_clause(&mut self, idx: Option<usize>) {
        if let Some(idx) = idx {
            self.cnf.bump_clause_activity(idx, self.cla_inc);
        }
    }

    fn decay_clause_activity(&mut self) {
        self.cla_inc /= self.opts.cla_decay;
    }

    /// Drop the worst learnt clauses once the budget is exceeded. Current
    /// reasons and binary clauses survive.
    fn reduce_db(&mut self) {
        let mut learnts = self.cnf.learnt_indices();
        if learnts.len() <= self.opts.max_learnts {
            return;
        }
        learnts.sort_by(|&a, &b| {
            self.cnf
                .clause_lbd(a)
                .cmp(&self.cnf.clause_lbd(b))
                .then_with(|| {
                    self.cnf
                        .clause_activity(b)
                        .total_cmp(&self.cnf.clause_activity(a))
                })
        });
        let reasons: HashSet<usize> = self.reason.iter().flatten().copied().collect();
        for &idx in &learnts[self.opts.max_learnts..] {
            if !reasons.contains(&idx) && self.cnf.clause(idx).len() > 2 {
                self.cnf.remove_clause(idx);
            }
        }
    }

    /// Record an assignment. Returns false when the variable already has a
    /// value (the caller decides whether that is a conflict).
    fn enqueue(&mut self, lit: Lit, reason: Option<usize>) -> bool {
        let v = lit_var(lit);
        if self.assigns[v as usize].is_some() {
            return false;
        }
        let val = lit > 0;
        self.assigns[v as usize] = Some(val);
        self.saved_phase.insert(v, val);
        self.levels[v as usize] = self.current_level();
        self.reason[v as usize] = reason;
        self.trail.push(lit);
        self.queue.push_back(lit);
        true
    }

    /// Watched-literal unit propagation. Returns the conflicting clause
    /// index, if any.
    fn propagate(&mut self) -> Option<usize> {
        while let Some(lit) = self.queue.pop_front() {
            let watching: Vec<usize> = self.cnf.watch_list(-lit).to_vec();
            for ci in watching {
                let clause = self.cnf.clause(ci);
                if clause.is_empty() {
                    continue;
                }
                let (w1, w2) = self.cnf.watchers(ci);
                let (other, first) = if w1 == -lit { (w2, true) } else { (w1, false) };
                if self.value(other) == Some(true) {
                    continue;
                }
                let mut found = false;
                let literals = clause.to_vec();
                for new_lit in literals {
                    if new_lit == other || new_lit == -lit {
                        continue;
                    }
                    if self.value(new_lit) != Some(false) {
                        let watchers = if first { (new_lit, other) } else { (other, new_lit) };
                        self.cnf.set_watchers(ci, watchers);
                        self.cnf.unwatch(-lit, ci);
                        self.cnf.watch(new_lit, ci);
                        found = true;
                        break;
                    }
                }
                if !found {
                    if self.value(other) == Some(false) {
                        return Some(ci);
                    }
                    self.enqueue(other, Some(ci));
                }
            }
        }
        None
    }

    /// Pop the highest-activity unassigned variable, revalidating stale heap
    /// entries against the lazily decayed activity.
    fn pick_branch_var(&mut self) -> Var {
        while let Some(entry) = self.heap.pop() {
            let v = entry.var;
            if self.assigns[v as usize].is_some() {
                continue;
            }
            let current = self.normalize_var(v);
            if (current - entry.activity).abs() > 1e-12 {
                self.push_var(v, Some(current));
                continue;
            }
            return v;
        }
        0
    }

    /// 1-UIP conflict analysis. Returns the learnt clause (asserting literal
    /// first) and the backtrack level.
    fn analyze(&mut self, conflict_idx: usize) -> (Vec<Lit>, u32) {
        self.bump_clause(Some(conflict_idx));
        for lit in self.cnf.clause(conflict_idx).to_vec() {
            self.bump_var(lit_var(lit));
        }

        let mut seen: HashSet<Var> = HashSet::new();
        let mut learnt: Vec<Lit> = Vec::new();
        let mut counter = 0i64;
        let mut clause: Vec<Lit> = self.cnf.clause(conflict_idx).to_vec();
        let mut i = self.trail.len();
        let current = self.current_level();

        let asserting = loop {
            for &lit in &clause {
                let v = lit_var(lit);
                self.bump_var(v);
                if !seen.contains(&v) && self.levels[v as usize] > 0 {
                    seen.insert(v);
                    if self.levels[v as usize] == current {
                        counter += 1;
                    } else {
                        learnt.push(lit);
                    }
                }
            }
            let lit = loop {
                i -= 1;
                let lit = self.trail[i];
                if seen.contains(&lit_var(lit)) {
                    break lit;
                }
            };
            let v = lit_var(lit);
            let clause_idx = self.reason[v as usize];
            self.bump_clause(clause_idx);
            if let Some(ci) = clause_idx {
                for &l in &self.cnf.clause(ci).to_vec() {
                    self.bump_var(lit_var(l));
                }
                clause = self
                    .cnf
                    .clause(ci)
                    .iter()
                    .copied()
                    .filter(|&l| lit_var(l) != v)
                    .collect();
            } else {
                clause = Vec::new();
            }
            counter -= 1;
            if counter <= 0 {
                break -lit;
            }
        };

        let back_lvl = learnt
            .iter()
            .map(|&l| self.levels[lit_var(l) as usize])
            .max()
            .unwrap_or(0);
        learnt.insert(0, asserting);
        for &lit in &learnt {
            self.bump_var(lit_var(lit));
        }
        (learnt, back_lvl)
    }

    fn backtrack(&mut self, level: u32) {
        while self.current_level() > level {
            let start = self.trail_lim.pop().unwrap_or(0);
            while self.trail.len() > start {
                let Some(lit) = self.trail.pop() else { break };
                let v = lit_var(lit);
                self.assigns[v as usize] = None;
                self.reason[v as usize] = None;
                self.levels[v as usize] = 0;
                self.push_var(v, None);
            }
            self.queue.clear();
        }
    }

    /// Minimize a root-level conflict by resolving through non-unit reasons
    /// until only assumption and unit-forced literals remain.
    fn minimize_core(&self, conflict_idx: usize) -> Vec<Lit> {
        let mut core: Vec<Lit> = self.cnf.clause(conflict_idx).to_vec();
        let mut changed = true;
        while changed {
            changed = false;
            for lit in core.clone() {
                let v = lit_var(lit);
                if let Some(rsn) = self.reason[v as usize]
                    && self.cnf.clause(rsn).len() > 1
                {
                    core.retain(|&l| l != lit);
                    for &l in self.cnf.clause(rsn) {
                        if lit_var(l) != v && !core.contains(&l) {
                            core.push(l);
                        }
                    }
                    changed = true;
                }
            }
        }
        core
    }

    fn finish(&mut self, sat: bool, conflicts: u64, core: Option<Vec<Lit>>) -> SatResult {
        self.last_conflicts = conflicts;
        let nvars = self.cnf.var_count();
        let mut assign = vec![false; nvars + 1];
        if sat {
            for v in 1..=nvars {
                assign[v] = self.assigns[v].unwrap_or(false);
            }
        }
        SatResult { sat, assign, unsat_core: core }
    }

    /// What: Solve the stored CNF under optional assumptions.
    ///
    /// Inputs:
    /// - `assumptions`: Literals decided at level 0 before search starts.
    ///
    /// Output:
    /// - A [`SatResult`]; on unsat, the core is the minimized root-level
    ///   conflict, and an assumption that is already forced false appears
    ///   alone in the core.
    pub fn solve(&mut self, assumptions: &[Lit]) -> SatResult {
        let nvars = self.cnf.var_count();
        self.assigns = vec![None; nvars + 1];
        self.levels = vec![0; nvars + 1];
        self.reason = vec![None; nvars + 1];
        self.trail.clear();
        self.trail_lim.clear();
        self.queue.clear();
        self.heap.clear();
        self.last_restarts = 0;
        self.last_conflicts = 0;

        if self.cnf.has_empty_clause() {
            return self.finish(false, 0, Some(Vec::new()));
        }

        for v in 1..=nvars as Var {
            self.push_var(v, None);
        }

        for idx in 0..self.cnf.clause_count() {
            if self.cnf.clause(idx).len() == 1 {
                let lit = self.cnf.clause(idx)[0];
                if self.value(lit) == Some(false) {
                    return self.finish(false, 0, Some(vec![lit]));
                }
                self.enqueue(lit, Some(idx));
            }
        }

        for &lit in assumptions {
            if self.value(lit) == Some(false) {
                return self.finish(false, 0, Some(vec![lit]));
            }
            self.enqueue(lit, None);
        }

        let mut conflicts: u64 = 0;
        let mut restart_count: u64 = 1;
        let mut restart_limit = luby(restart_count) * self.opts.restart_unit;

        loop {
            if let Some(confl) = self.propagate() {
                conflicts += 1;
                if self.current_level() == 0 {
                    let core = self.minimize_core(confl);
                    return self.finish(false, conflicts, Some(core));
                }
                let (learnt, back_lvl) = self.analyze(confl);
                let lbd = {
                    let levels: HashSet<u32> = learnt
                        .iter()
                        .map(|&l| self.levels[lit_var(l) as usize])
                        .collect();
                    levels.len() as u32
                };
                let asserting = learnt[0];
                let ci = self.cnf.add_clause(learnt, true, lbd);
                self.bump_clause(Some(ci));
                self.backtrack(back_lvl);
                self.enqueue(asserting, Some(ci));
                self.decay_clause_activity();
                self.decay_var_activity();
                if self.cnf.learnt_count() > self.opts.max_learnts {
                    self.reduce_db();
                }
                if conflicts >= restart_limit {
                    restart_count += 1;
                    restart_limit = luby(restart_count) * self.opts.restart_unit;
                    self.last_restarts += 1;
                    self.backtrack(0);
                }
            } else {
                let v = self.pick_branch_var();
                if v == 0 {
                    return self.finish(true, conflicts, None);
                }
                self.trail_lim.push(self.trail.len());
                let lit = match self.saved_phase.get(&v) {
                    Some(&phase) => {
                        if phase {
                            v as Lit
                        } else {
                            -(v as Lit)
                        }
                    }
                    None => {
                        if self.opts.prefer_false.contains(&v)
                            && !self.opts.prefer_true.contains(&v)
                        {
                            -(v as Lit)
                        } else {
                            v as Lit
                        }
                    }
                };
                self.enqueue(lit, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(cnf: &mut Cnf, names: &[&str]) -> Vec<Lit> {
        names.iter().map(|n| cnf.new_var(n) as Lit).collect()
    }

    #[test]
    fn test_luby_sequence() {
        let seq: Vec<u64> = (1..=15).map(luby).collect();
        assert_eq!(seq, vec![1, 1, 2, 1, 1, 2, 4, 1, 1, 2, 1, 1, 2, 4, 8]);
    }

    #[test]
    fn test_conflicting_packages_unsat_with_core() {
        let mut cnf = Cnf::new();
        let v = vars(&mut cnf, &["A", "B", "C"]);
        let (a, b, c) = (v[0], v[1], v[2]);
        // A -> B, B conflicts C, require both A and C.
        cnf.add([vec![-a, b], vec![-b, -c], vec![a], vec![c]]);
        let mut solver = CdclSolver::new(cnf, SolverOptions::default());
        let res = solver.solve(&[]);
        assert!(!res.sat);
        let mut core_names: Vec<&str> = res
            .unsat_core
            .as_ref()
            .expect("core")
            .iter()
            .filter_map(|&l| solver.cnf().name(lit_var(l)))
            .collect();
        core_names.sort_unstable();
        assert_eq!(core_names, vec!["A", "C"]);
    }

    #[test]
    fn test_alternative_dependency_sat() {
        let mut cnf = Cnf::new();
        let v = vars(&mut cnf, &["A", "B", "C"]);
        let (a, b, c) = (v[0], v[1], v[2]);
        // A -> (B or C), B conflicts C, require A.
        cnf.add([vec![-a, b, c], vec![-b, -c], vec![a]]);
        let mut solver = CdclSolver::new(cnf, SolverOptions::default());
        let res = solver.solve(&[]);
        assert!(res.sat);
        assert!(res.value(lit_var(a)));
        // Exactly one of B and C.
        assert!(res.value(lit_var(b)) ^ res.value(lit_var(c)));
    }

    #[test]
    fn test_decay_map_sat_regression() {
        let mut cnf = Cnf::new();
        let v = vars(&mut cnf, &["A", "B"]);
        let (a, b) = (v[0], v[1]);
        cnf.add([vec![a, b], vec![-a, -b], vec![a]]);
        let opts = SolverOptions {
            decay_map: HashMap::from([(lit_var(a), 0.6), (lit_var(b), 0.8)]),
            ..SolverOptions::default()
        };
        let mut solver = CdclSolver::new(cnf, opts);
        let res = solver.solve(&[]);
        assert!(res.sat);
        assert!(res.value(lit_var(a)));
        assert!(!res.value(lit_var(b)));
    }

    #[test]
    fn test_branching_unsat() {
        let mut cnf = Cnf::new();
        let v = vars(&mut cnf, &["A", "B"]);
        let (a, b) = (v[0], v[1]);
        // All four combinations excluded.
        cnf.add([vec![a, b], vec![-a, b], vec![a, -b], vec![-a, -b]]);
        let mut solver = CdclSolver::new(cnf, SolverOptions::default());
        let res = solver.solve(&[]);
        assert!(!res.sat);
        assert!(solver.last_conflicts >= 1);
    }

    #[test]
    fn test_empty_clause_is_immediately_unsat() {
        let mut cnf = Cnf::new();
        cnf.new_var("A");
        cnf.add_clause(Vec::new(), false, 0);
        let mut solver = CdclSolver::new(cnf, SolverOptions::default());
        let res = solver.solve(&[]);
        assert!(!res.sat);
        assert_eq!(res.unsat_core, Some(Vec::new()));
    }

    #[test]
    fn test_assumption_forced_false_appears_in_core() {
        let mut cnf = Cnf::new();
        let v = vars(&mut cnf, &["A"]);
        let a = v[0];
        cnf.add([vec![-a]]);
        let mut solver = CdclSolver::new(cnf, SolverOptions::default());
        let res = solver.solve(&[a]);
        assert!(!res.sat);
        assert_eq!(res.unsat_core, Some(vec![a]));
    }

    #[test]
    fn test_prefer_false_initial_phase() {
        let mut cnf = Cnf::new();
        let v = vars(&mut cnf, &["A", "B"]);
        let (a, b) = (v[0], v[1]);
        // A free, B free, no constraints binding them together.
        cnf.add([vec![a, b]]);
        let opts = SolverOptions {
            prefer_false: HashSet::from([lit_var(a)]),
            prefer_true: HashSet::from([lit_var(b)]),
            ..SolverOptions::default()
        };
        let mut solver = CdclSolver::new(cnf, opts);
        let res = solver.solve(&[]);
        assert!(res.sat);
        assert!(!res.value(lit_var(a)));
        assert!(res.value(lit_var(b)));
    }

    #[test]
    fn test_phase_saving_survives_restarts() {
        // A chain long enough to produce conflicts and exercise phase reuse.
        let mut cnf = Cnf::new();
        let n = 12;
        let lits: Vec<Lit> = (0..n)
            .map(|i| cnf.new_var(&format!("v{i}")) as Lit)
            .collect();
        for w in lits.windows(2) {
            cnf.add([vec![-w[0], w[1]]]);
        }
        cnf.add([vec![lits[0]]]);
        let mut solver = CdclSolver::new(cnf, SolverOptions::default());
        let res = solver.solve(&[]);
        assert!(res.sat);
        for &l in &lits {
            assert!(res.value(lit_var(l)));
        }
    }

    #[test]
    fn test_restarts_occur_on_unsat_with_small_unit() {
        let mut cnf = Cnf::new();
        let v = vars(&mut cnf, &["A", "B"]);
        let (a, b) = (v[0], v[1]);
        cnf.add([vec![a, b], vec![-a, b], vec![a, -b], vec![-a, -b]]);
        let opts = SolverOptions { restart_unit: 1, ..SolverOptions::default() };
        let mut solver = CdclSolver::new(cnf, opts);
        let res = solver.solve(&[]);
        assert!(!res.sat);
        assert!(solver.last_restarts >= 1);
    }

    #[test]
    fn test_hard_unsat_terminates() {
        // Pigeonhole PHP(5,4): 5 pigeons in 4 holes.
        let pigeons = 5;
        let holes = 4;
        let mut cnf = Cnf::new();
        let mut var = vec![vec![0 as Lit; holes]; pigeons];
        for (p, row) in var.iter_mut().enumerate() {
            for (h, slot) in row.iter_mut().enumerate() {
                *slot = cnf.new_var(&format!("p{p}h{h}")) as Lit;
            }
        }
        for row in &var {
            cnf.add([row.clone()]);
        }
        for h in 0..holes {
            for p1 in 0..pigeons {
                for p2 in (p1 + 1)..pigeons {
                    cnf.add([vec![-var[p1][h], -var[p2][h]]]);
                }
            }
        }
        let opts = SolverOptions { max_learnts: 8, ..SolverOptions::default() };
        let mut solver = CdclSolver::new(cnf, opts);
        let res = solver.solve(&[]);
        assert!(!res.sat);
        assert!(solver.last_conflicts > 0);
    }

    #[test]
    fn test_learnt_clauses_do_not_slow_resolve() {
        // Monotonicity: solving the same instance again with retained learnt
        // clauses must not take more conflicts than the first pass.
        let mut cnf = Cnf::new();
        let n = 8;
        let lits: Vec<Lit> = (0..n)
            .map(|i| cnf.new_var(&format!("x{i}")) as Lit)
            .collect();
        for i in 0..n - 2 {
            cnf.add([vec![lits[i], lits[i + 1], lits[i + 2]]]);
            cnf.add([vec![-lits[i], -lits[i + 1]]]);
        }
        let mut solver = CdclSolver::new(cnf, SolverOptions::default());
        let first = solver.solve(&[]);
        let first_conflicts = solver.last_conflicts;
        let second = solver.solve(&[]);
        assert_eq!(first.sat, second.sat);
        assert!(solver.last_conflicts <= first_conflicts);
    }
}

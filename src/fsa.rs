//! In-memory finite automata over byte labels: Thompson-style NFA
//! construction, subset construction with wildcard default transitions,
//! partition-refinement minimization, direct DFA construction from sorted
//! strings (Daciuk-Mihov), and the `next_valid_string` walk that drives
//! fuzzy term enumeration.
//!
//! These graphs are transient: the term dictionary serializes through
//! [`crate::fst`], while Levenshtein automata live only for one query.

use crate::Error;
use fnv::{FnvHashMap as HashMap, FnvHashSet as HashSet};
use std::collections::BTreeMap;
use std::collections::BTreeSet;

pub type StateId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Label {
    /// Consumes no input.
    Epsilon,
    /// Matches any single byte; becomes a DFA default transition.
    Any,
    Byte(u8),
}

/// Non-deterministic automaton with a single initial and a single final
/// state, the shape all the construction primitives produce.
#[derive(Debug, Clone)]
pub struct Nfa {
    transitions: Vec<HashMap<Label, HashSet<StateId>>>,
    finals: HashSet<StateId>,
    pub initial: StateId,
    pub terminal: StateId,
}

impl Nfa {
    fn with_states(n: usize) -> Nfa {
        Nfa {
            transitions: vec![HashMap::default(); n],
            finals: HashSet::default(),
            initial: 0,
            terminal: 0,
        }
    }

    pub fn add_state(&mut self) -> StateId {
        self.transitions.push(HashMap::default());
        self.transitions.len() - 1
    }

    pub fn add_transition(&mut self, src: StateId, label: Label, dest: StateId) {
        self.transitions[src].entry(label).or_default().insert(dest);
    }

    pub fn add_final_state(&mut self, state: StateId) {
        self.finals.insert(state);
    }

    /// Copy `other`'s states into this arena; returns its remapped
    /// (initial, terminal) pair.
    fn embed(&mut self, other: &Nfa) -> (StateId, StateId) {
        let offset = self.transitions.len();
        for arcs in &other.transitions {
            let mut remapped: HashMap<Label, HashSet<StateId>> = HashMap::default();
            for (label, dests) in arcs {
                remapped.insert(*label, dests.iter().map(|d| d + offset).collect());
            }
            self.transitions.push(remapped);
        }
        (other.initial + offset, other.terminal + offset)
    }

    /// Follow epsilon arcs to fixpoint.
    fn expand(&self, mut states: BTreeSet<StateId>) -> BTreeSet<StateId> {
        let mut frontier: Vec<StateId> = states.iter().copied().collect();
        while let Some(state) = frontier.pop() {
            if let Some(dests) = self.transitions[state].get(&Label::Epsilon) {
                for &dest in dests {
                    if states.insert(dest) {
                        frontier.push(dest);
                    }
                }
            }
        }
        states
    }

    fn start(&self) -> BTreeSet<StateId> {
        let mut s = BTreeSet::new();
        s.insert(self.initial);
        self.expand(s)
    }

    fn is_final(&self, states: &BTreeSet<StateId>) -> bool {
        states.iter().any(|s| self.finals.contains(s))
    }

    /// Byte labels leaving this state set, ignoring epsilon; true when a
    /// wildcard arc is present.
    fn get_labels(&self, states: &BTreeSet<StateId>) -> (BTreeSet<u8>, bool) {
        let mut labels = BTreeSet::new();
        let mut any = false;
        for &s in states {
            for label in self.transitions[s].keys() {
                match label {
                    Label::Byte(b) => {
                        labels.insert(*b);
                    }
                    Label::Any => any = true,
                    Label::Epsilon => {}
                }
            }
        }
        (labels, any)
    }

    fn next_state_set(&self, states: &BTreeSet<StateId>, byte: u8) -> BTreeSet<StateId> {
        let mut dest: BTreeSet<StateId> = BTreeSet::new();
        for &s in states {
            if let Some(targets) = self.transitions[s].get(&Label::Byte(byte)) {
                dest.extend(targets.iter().copied());
            }
            if let Some(targets) = self.transitions[s].get(&Label::Any) {
                dest.extend(targets.iter().copied());
            }
        }
        self.expand(dest)
    }

    /// Wildcard successors only, for the DFA default transition.
    fn any_state_set(&self, states: &BTreeSet<StateId>) -> BTreeSet<StateId> {
        let mut dest: BTreeSet<StateId> = BTreeSet::new();
        for &s in states {
            if let Some(targets) = self.transitions[s].get(&Label::Any) {
                dest.extend(targets.iter().copied());
            }
        }
        self.expand(dest)
    }

    /// Powerset construction. A wildcard arc in a state set becomes the
    /// resulting DFA state's default transition rather than widening the
    /// label alphabet.
    pub fn to_dfa(&self) -> Dfa {
        let mut dfa = Dfa::default();
        let mut seen: HashMap<Vec<StateId>, StateId> = HashMap::default();

        let start = self.start();
        let start_key: Vec<StateId> = start.iter().copied().collect();
        let start_id = dfa.add_state();
        seen.insert(start_key, start_id);
        if self.is_final(&start) {
            dfa.add_final_state(start_id);
        }

        let mut stack = vec![(start_id, start)];
        while let Some((src_id, states)) = stack.pop() {
            let (labels, any) = self.get_labels(&states);
            for byte in labels {
                let dest = self.next_state_set(&states, byte);
                if dest.is_empty() {
                    continue;
                }
                let dest_id = intern_state_set(self, &mut dfa, &mut seen, &mut stack, dest);
                dfa.add_transition(src_id, byte, dest_id);
            }
            if any {
                let dest = self.any_state_set(&states);
                if !dest.is_empty() {
                    let dest_id = intern_state_set(self, &mut dfa, &mut seen, &mut stack, dest);
                    dfa.set_default_transition(src_id, dest_id);
                }
            }
        }
        dfa
    }
}

fn intern_state_set(
    nfa: &Nfa,
    dfa: &mut Dfa,
    seen: &mut HashMap<Vec<StateId>, StateId>,
    stack: &mut Vec<(StateId, BTreeSet<StateId>)>,
    states: BTreeSet<StateId>,
) -> StateId {
    let key: Vec<StateId> = states.iter().copied().collect();
    if let Some(&id) = seen.get(&key) {
        return id;
    }
    let id = dfa.add_state();
    seen.insert(key, id);
    if nfa.is_final(&states) {
        dfa.add_final_state(id);
    }
    stack.push((id, states));
    id
}

// Construction primitives. Each returns an NFA with one initial and one
// final state so they compose.

pub fn basic(label: Label) -> Nfa {
    let mut nfa = Nfa::with_states(2);
    nfa.terminal = 1;
    nfa.add_transition(0, label, 1);
    nfa.add_final_state(1);
    nfa
}

pub fn epsilon() -> Nfa {
    basic(Label::Epsilon)
}

pub fn any_label() -> Nfa {
    basic(Label::Any)
}

pub fn string(s: &[u8]) -> Nfa {
    let mut nfa = Nfa::with_states(s.len() + 1);
    for (i, b) in s.iter().enumerate() {
        nfa.add_transition(i, Label::Byte(*b), i + 1);
    }
    nfa.terminal = s.len();
    nfa.add_final_state(nfa.terminal);
    nfa
}

pub fn charset(labels: &[u8]) -> Nfa {
    let mut nfa = Nfa::with_states(2);
    nfa.terminal = 1;
    for b in labels {
        nfa.add_transition(0, Label::Byte(*b), 1);
    }
    nfa.add_final_state(1);
    nfa
}

pub fn choice(a: &Nfa, b: &Nfa) -> Nfa {
    let mut nfa = Nfa::with_states(2);
    nfa.terminal = 1;
    let (a_init, a_term) = nfa.embed(a);
    let (b_init, b_term) = nfa.embed(b);
    nfa.add_transition(0, Label::Epsilon, a_init);
    nfa.add_transition(0, Label::Epsilon, b_init);
    nfa.add_transition(a_term, Label::Epsilon, 1);
    nfa.add_transition(b_term, Label::Epsilon, 1);
    nfa.add_final_state(1);
    nfa
}

pub fn concat(a: &Nfa, b: &Nfa) -> Nfa {
    let mut nfa = Nfa::with_states(0);
    let (a_init, a_term) = nfa.embed(a);
    let (b_init, b_term) = nfa.embed(b);
    nfa.initial = a_init;
    nfa.terminal = b_term;
    nfa.add_transition(a_term, Label::Epsilon, b_init);
    nfa.add_final_state(b_term);
    nfa
}

pub fn star(a: &Nfa) -> Nfa {
    let mut nfa = Nfa::with_states(2);
    nfa.terminal = 1;
    let (a_init, a_term) = nfa.embed(a);
    nfa.add_transition(0, Label::Epsilon, a_init);
    nfa.add_transition(0, Label::Epsilon, 1);
    nfa.add_transition(a_term, Label::Epsilon, a_init);
    nfa.add_transition(a_term, Label::Epsilon, 1);
    nfa.add_final_state(1);
    nfa
}

pub fn plus(a: &Nfa) -> Nfa {
    concat(a, &star(a))
}

pub fn optional(a: &Nfa) -> Nfa {
    choice(a, &epsilon())
}

/// NFA accepting exactly the strings within `k` edits of `term`; the first
/// `prefix` bytes must match exactly. States are the classic (position,
/// edits) grid.
pub fn levenshtein_automaton(term: &[u8], k: u32, prefix: usize) -> Nfa {
    let k = k as usize;
    let n = term.len();
    let state = |i: usize, e: usize| i * (k + 1) + e;
    let mut nfa = Nfa::with_states((n + 1) * (k + 1));
    nfa.initial = state(0, 0);

    for (i, &c) in term.iter().enumerate().take(prefix) {
        nfa.add_transition(state(i, 0), Label::Byte(c), state(i + 1, 0));
    }
    for (i, &c) in term.iter().enumerate().skip(prefix) {
        for e in 0..=k {
            // Correct character
            nfa.add_transition(state(i, e), Label::Byte(c), state(i + 1, e));
            if e < k {
                // Insertion before position i
                nfa.add_transition(state(i, e), Label::Any, state(i, e + 1));
                // Deletion of term[i]
                nfa.add_transition(state(i, e), Label::Epsilon, state(i + 1, e + 1));
                // Substitution for term[i]
                nfa.add_transition(state(i, e), Label::Any, state(i + 1, e + 1));
            }
        }
    }
    for e in 0..=k {
        if e < k {
            nfa.add_transition(state(n, e), Label::Any, state(n, e + 1));
        }
        nfa.add_final_state(state(n, e));
    }
    nfa
}

/// Deterministic automaton over byte labels. Each state may carry a
/// default transition, taken when no explicit label matches.
#[derive(Debug, Clone, Default)]
pub struct Dfa {
    transitions: Vec<BTreeMap<u8, StateId>>,
    defaults: HashMap<StateId, StateId>,
    finals: HashSet<StateId>,
    pub initial: StateId,
}

impl Dfa {
    pub fn num_states(&self) -> usize {
        self.transitions.len()
    }

    pub fn add_state(&mut self) -> StateId {
        self.transitions.push(BTreeMap::new());
        self.transitions.len() - 1
    }

    pub fn add_transition(&mut self, src: StateId, label: u8, dest: StateId) {
        self.transitions[src].insert(label, dest);
    }

    pub fn set_default_transition(&mut self, src: StateId, dest: StateId) {
        self.defaults.insert(src, dest);
    }

    pub fn add_final_state(&mut self, state: StateId) {
        self.finals.insert(state);
    }

    pub fn is_final(&self, state: StateId) -> bool {
        self.finals.contains(&state)
    }

    pub fn next_state(&self, src: StateId, label: u8) -> Option<StateId> {
        self.transitions[src]
            .get(&label)
            .copied()
            .or_else(|| self.defaults.get(&src).copied())
    }

    pub fn accepts(&self, input: &[u8]) -> bool {
        let mut state = self.initial;
        for &b in input {
            match self.next_state(state, b) {
                Some(next) => state = next,
                None => return false,
            }
        }
        self.is_final(state)
    }

    /// Smallest label >= `after`+1 leaving `s` (any label if the state has
    /// a default transition).
    pub fn find_next_edge(&self, s: StateId, after: Option<u8>) -> Option<u8> {
        let label = match after {
            None => 0,
            Some(255) => return None,
            Some(b) => b + 1,
        };
        if self.defaults.contains_key(&s) {
            return Some(label);
        }
        self.transitions[s].range(label..).next().map(|(&b, _)| b)
    }

    /// The lexicographically smallest accepted string >= `input`, found by
    /// following the DFA as far as the input permits and then
    /// wall-following for the smallest acceptance. Requires a pruned DFA:
    /// every live non-final state can reach an acceptance.
    pub fn next_valid_string(&self, input: &[u8]) -> Option<Vec<u8>> {
        let mut stack: Vec<(Vec<u8>, StateId, Option<u8>)> = Vec::new();
        let mut state = self.initial;
        let mut consumed_all = true;

        for (i, &b) in input.iter().enumerate() {
            stack.push((input[..i].to_vec(), state, Some(b)));
            match self.next_state(state, b) {
                Some(next) => state = next,
                None => {
                    consumed_all = false;
                    break;
                }
            }
        }
        if consumed_all {
            if self.is_final(state) {
                return Some(input.to_vec());
            }
            stack.push((input.to_vec(), state, None));
        }

        while let Some((mut path, state, label)) = stack.pop() {
            if let Some(next_label) = self.find_next_edge(state, label) {
                path.push(next_label);
                let next = self
                    .next_state(state, next_label)
                    .expect("find_next_edge returned a dead label");
                if self.is_final(next) {
                    return Some(path);
                }
                stack.push((path, next, None));
            }
        }
        None
    }

    fn reachable_from(&self, src: StateId) -> HashSet<StateId> {
        let mut reached = HashSet::default();
        reached.insert(src);
        let mut stack = vec![src];
        while let Some(state) = stack.pop() {
            for &dest in self
                .transitions[state]
                .values()
                .chain(self.defaults.get(&state))
            {
                if reached.insert(dest) {
                    stack.push(dest);
                }
            }
        }
        reached
    }

    /// Partition-refinement minimization: drop unreachable states, start
    /// from the {finals, non-finals} split, refine until no block member
    /// disagrees on where a label leads, then rewrite onto one
    /// representative per block (smallest id; the initial state always
    /// represents its own block).
    pub fn minimize(&mut self) {
        let reachable = self.reachable_from(self.initial);
        let mut order: Vec<StateId> = reachable.iter().copied().collect();
        order.sort_unstable();

        // block id per state; initial partition is {finals, non-finals}.
        let mut block: HashMap<StateId, usize> = HashMap::default();
        for &s in &order {
            block.insert(s, if self.is_final(s) { 1 } else { 0 });
        }

        let mut num_blocks = 0;
        loop {
            // Split by signature: previous block, plus where each label
            // and the default lead in block space.
            let mut groups: BTreeMap<(usize, Vec<(u8, usize)>, Option<usize>), Vec<StateId>> =
                BTreeMap::new();
            for &s in &order {
                let sig: Vec<(u8, usize)> = self.transitions[s]
                    .iter()
                    .map(|(&b, dest)| (b, block[dest]))
                    .collect();
                let default_sig = self.defaults.get(&s).map(|dest| block[dest]);
                groups
                    .entry((block[&s], sig, default_sig))
                    .or_default()
                    .push(s);
            }
            let mut next_block: HashMap<StateId, usize> = HashMap::default();
            for (id, members) in groups.values().enumerate() {
                for &s in members {
                    next_block.insert(s, id);
                }
            }
            let refined = groups.len() != num_blocks;
            num_blocks = groups.len();
            block = next_block;
            if !refined {
                break;
            }
        }

        // One representative per block: smallest id, except the block
        // containing the initial state keeps the initial state.
        let mut representative: HashMap<usize, StateId> = HashMap::default();
        for &s in &order {
            let entry = representative.entry(block[&s]).or_insert(s);
            if s < *entry {
                *entry = s;
            }
        }
        representative.insert(block[&self.initial], self.initial);
        let resolve = |s: StateId| representative[&block[&s]];

        let mut transitions: Vec<BTreeMap<u8, StateId>> =
            vec![BTreeMap::new(); self.transitions.len()];
        let mut defaults: HashMap<StateId, StateId> = HashMap::default();
        let mut finals: HashSet<StateId> = HashSet::default();
        for &rep in representative.values() {
            for (&label, &dest) in &self.transitions[rep] {
                transitions[rep].insert(label, resolve(dest));
            }
            if let Some(dest) = self.defaults.get(&rep) {
                defaults.insert(rep, resolve(*dest));
            }
            if self.is_final(rep) {
                finals.insert(rep);
            }
        }
        self.transitions = transitions;
        self.defaults = defaults;
        self.finals = finals;
        self.prune_dead_states();
    }

    /// Remove non-final states whose only way forward is a self-loop, and
    /// the arcs that point at them. Removal can orphan more states, so
    /// iterate to fixpoint.
    fn prune_dead_states(&mut self) {
        let mut removed: HashSet<StateId> = HashSet::default();
        loop {
            let mut dead: Vec<StateId> = Vec::new();
            for (s, arcs) in self.transitions.iter().enumerate() {
                if s == self.initial || self.is_final(s) || removed.contains(&s) {
                    continue;
                }
                let outgoing = arcs
                    .values()
                    .chain(self.defaults.get(&s))
                    .any(|&dest| dest != s);
                if !outgoing {
                    dead.push(s);
                }
            }
            if dead.is_empty() {
                break;
            }
            removed.extend(dead);
            for (s, arcs) in self.transitions.iter_mut().enumerate() {
                if removed.contains(&s) {
                    arcs.clear();
                } else {
                    arcs.retain(|_, dest| !removed.contains(dest));
                }
            }
            self.defaults
                .retain(|s, dest| !removed.contains(s) && !removed.contains(dest));
        }
    }

    /// All accepted strings in lexicographic order. The graphs we flatten
    /// are acyclic dictionaries; a cyclic DFA would not terminate.
    pub fn flatten(&self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut path = Vec::new();
        self.flatten_from(self.initial, &mut path, &mut out);
        out
    }

    fn flatten_from(&self, state: StateId, path: &mut Vec<u8>, out: &mut Vec<Vec<u8>>) {
        if self.is_final(state) {
            out.push(path.clone());
        }
        for (&label, &dest) in &self.transitions[state] {
            path.push(label);
            self.flatten_from(dest, path, out);
            path.pop();
        }
    }
}

/// Node under construction in `strings_dfa`.
struct DmNode {
    id: StateId,
    arcs: BTreeMap<u8, StateId>,
    accept: bool,
}

impl DmNode {
    fn fingerprint(&self) -> (Vec<(u8, StateId)>, bool) {
        (
            self.arcs.iter().map(|(&b, &d)| (b, d)).collect(),
            self.accept,
        )
    }
}

/// Build the minimal DFA for a sorted set of strings directly
/// (Daciuk-Mihov), without going through an NFA. Inputs must be strictly
/// increasing and non-empty.
pub fn strings_dfa<'a, I>(strings: I) -> Result<Dfa, Error>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut dfa = Dfa::default();
    dfa.add_state(); // root is state 0
    let mut next_id = 1;

    let mut last: Vec<u8> = Vec::new();
    let mut seen: HashMap<(Vec<(u8, StateId)>, bool), StateId> = HashMap::default();
    let mut nodes = vec![DmNode {
        id: 0,
        arcs: BTreeMap::new(),
        accept: false,
    }];

    for string in strings {
        if string.is_empty() {
            return Err(Error::InvalidValue("can't add an empty string".into()));
        }
        if !last.is_empty() && string <= last.as_slice() {
            return Err(Error::OrderViolation(format!(
                "strings must increase: {:?}..{:?}",
                last, string
            )));
        }

        let prefixlen = last
            .iter()
            .zip(string.iter())
            .take_while(|(a, b)| a == b)
            .count();

        // The suffix of the previous string is no longer shared; freeze it.
        add_suffix(&mut dfa, &mut nodes, &last, prefixlen + 1, &mut seen);

        for &label in &string[prefixlen..] {
            let node = DmNode {
                id: next_id,
                arcs: BTreeMap::new(),
                accept: false,
            };
            next_id += 1;
            while dfa.num_states() <= node.id {
                dfa.add_state();
            }
            nodes.last_mut().unwrap().arcs.insert(label, node.id);
            nodes.push(node);
        }
        nodes.last_mut().unwrap().accept = true;

        last.clear();
        last.extend_from_slice(string);
    }

    add_suffix(&mut dfa, &mut nodes, &last, 0, &mut seen);
    Ok(dfa)
}

fn add_suffix(
    dfa: &mut Dfa,
    nodes: &mut Vec<DmNode>,
    last: &[u8],
    downto: usize,
    seen: &mut HashMap<(Vec<(u8, StateId)>, bool), StateId>,
) {
    while nodes.len() > downto.max(1) {
        let node = nodes.pop().unwrap();
        let fingerprint = node.fingerprint();

        let this = match seen.get(&fingerprint) {
            Some(&existing) => {
                // Structurally equal node already frozen; point the parent
                // at it instead.
                let inlabel = last[nodes.len() - 1];
                let parent = nodes.last_mut().unwrap();
                parent.arcs.insert(inlabel, existing);
                continue;
            }
            None => {
                if node.accept {
                    dfa.add_final_state(node.id);
                }
                seen.insert(fingerprint, node.id);
                node.id
            }
        };
        for (label, dest) in node.arcs {
            dfa.add_transition(this, label, dest);
        }
    }
    if downto == 0 {
        // Freeze the root's arcs in place.
        let root = &nodes[0];
        if root.accept {
            dfa.add_final_state(root.id);
        }
        for (&label, &dest) in &root.arcs {
            dfa.add_transition(root.id, label, dest);
        }
    }
}

/// Lockstep enumeration of a query DFA against an ordered dictionary.
/// `lookup` must return the smallest dictionary key >= its argument. Once
/// either side is exhausted the enumeration is permanently finished and
/// `lookup` is never called again.
pub struct FuzzyMatches<'d, F> {
    dfa: &'d Dfa,
    lookup: F,
    /// Where the next call resumes; `None` once exhausted.
    probe: Option<Vec<u8>>,
}

impl<'d, F> FuzzyMatches<'d, F>
where
    F: FnMut(&[u8]) -> Result<Option<Vec<u8>>, Error>,
{
    pub fn new(dfa: &'d Dfa, lookup: F) -> Self {
        FuzzyMatches {
            dfa,
            lookup,
            probe: Some(Vec::new()),
        }
    }

    pub fn next_match(&mut self) -> Result<Option<Vec<u8>>, Error> {
        let mut probe = match self.probe.take() {
            Some(p) => p,
            None => return Ok(None),
        };
        loop {
            let matched = match self.dfa.next_valid_string(&probe) {
                Some(m) => m,
                None => return Ok(None),
            };
            let key = match (self.lookup)(&matched)? {
                Some(k) => k,
                None => return Ok(None),
            };
            if key == matched {
                // Resume just past this key next time.
                let mut resume = key.clone();
                resume.push(0);
                self.probe = Some(resume);
                return Ok(Some(key));
            }
            probe = key;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lev_dfa(term: &[u8], k: u32) -> Dfa {
        let mut dfa = levenshtein_automaton(term, k, 0).to_dfa();
        dfa.minimize();
        dfa
    }

    #[test]
    fn basic_string_acceptance() {
        let dfa = string(b"cat").to_dfa();
        assert!(dfa.accepts(b"cat"));
        assert!(!dfa.accepts(b"ca"));
        assert!(!dfa.accepts(b"cats"));
    }

    #[test]
    fn choice_and_star() {
        // (ab|cd)* over bytes
        let ab = string(b"ab");
        let cd = string(b"cd");
        let either = choice(&ab, &cd);
        let dfa = star(&either).to_dfa();
        assert!(dfa.accepts(b""));
        assert!(dfa.accepts(b"ab"));
        assert!(dfa.accepts(b"abcdab"));
        assert!(!dfa.accepts(b"abc"));
    }

    #[test]
    fn charset_and_plus() {
        let vowels = charset(b"aeiou");
        let dfa = plus(&vowels).to_dfa();
        assert!(dfa.accepts(b"a"));
        assert!(dfa.accepts(b"aeiou"));
        assert!(!dfa.accepts(b""));
        assert!(!dfa.accepts(b"ax"));
    }

    #[test]
    fn optional_matches_empty() {
        let dfa = optional(&string(b"x")).to_dfa();
        assert!(dfa.accepts(b""));
        assert!(dfa.accepts(b"x"));
        assert!(!dfa.accepts(b"xx"));
    }

    #[test]
    fn wildcard_default_transition() {
        // a . c, where the middle byte can be anything.
        let dfa = concat(&concat(&string(b"a"), &any_label()), &string(b"c")).to_dfa();
        assert!(dfa.accepts(b"abc"));
        assert!(dfa.accepts(b"azc"));
        assert!(dfa.accepts(b"a\x00c"));
        assert!(!dfa.accepts(b"ac"));
        assert!(!dfa.accepts(b"abbc"));
    }

    #[test]
    fn minimize_preserves_language() {
        // (a|b)a* has a small minimal form; check language equality over
        // short strings.
        let head = choice(&string(b"a"), &string(b"b"));
        let nfa = concat(&head, &star(&string(b"a")));
        let big = nfa.to_dfa();
        let mut small = nfa.to_dfa();
        small.minimize();
        let alphabet = b"ab";
        let mut inputs: Vec<Vec<u8>> = vec![Vec::new()];
        for _ in 0..4 {
            let mut next = Vec::new();
            for prefix in &inputs {
                for &b in alphabet {
                    let mut w = prefix.clone();
                    w.push(b);
                    next.push(w);
                }
            }
            inputs.extend(next);
        }
        for input in &inputs {
            assert_eq!(
                big.accepts(input),
                small.accepts(input),
                "disagree on {:?}",
                input
            );
        }
    }

    #[test]
    fn strings_dfa_enumerates_in_order() {
        let words: Vec<&[u8]> = vec![b"bat", b"bath", b"cat"];
        let dfa = strings_dfa(words.iter().copied()).unwrap();
        assert_eq!(
            vec![b"bat".to_vec(), b"bath".to_vec(), b"cat".to_vec()],
            dfa.flatten()
        );
        assert!(dfa.accepts(b"bat"));
        assert!(!dfa.accepts(b"ba"));
        assert!(!dfa.accepts(b"bats"));
    }

    #[test]
    fn strings_dfa_shares_suffixes() {
        // The "at" tails are structurally identical, so the subtrees
        // below 'b' and 'c' collapse into one.
        let words: Vec<&[u8]> = vec![b"bat", b"cat"];
        let dfa = strings_dfa(words.iter().copied()).unwrap();
        let b_next = dfa.next_state(dfa.initial, b'b').unwrap();
        let c_next = dfa.next_state(dfa.initial, b'c').unwrap();
        assert_eq!(b_next, c_next);

        // A divergent tail keeps the heads apart.
        let words: Vec<&[u8]> = vec![b"bat", b"bath", b"cat"];
        let dfa = strings_dfa(words.iter().copied()).unwrap();
        let b_next = dfa.next_state(dfa.initial, b'b').unwrap();
        let c_next = dfa.next_state(dfa.initial, b'c').unwrap();
        assert_ne!(b_next, c_next);
        // But the leaf after "bath" and the leaf after "cat" coincide.
        let bat = dfa
            .next_state(dfa.next_state(b_next, b'a').unwrap(), b't')
            .unwrap();
        let bath_leaf = dfa.next_state(bat, b'h').unwrap();
        let cat_leaf = dfa
            .next_state(dfa.next_state(c_next, b'a').unwrap(), b't')
            .unwrap();
        assert_eq!(bath_leaf, cat_leaf);
    }

    #[test]
    fn strings_dfa_rejects_disorder_and_empty() {
        match strings_dfa([b"b".as_ref(), b"a".as_ref()].iter().copied()) {
            Err(Error::OrderViolation(_)) => {}
            other => panic!("expected OrderViolation, got {:?}", other.map(|_| ())),
        }
        match strings_dfa([b"".as_ref()].iter().copied()) {
            Err(Error::InvalidValue(_)) => {}
            other => panic!("expected InvalidValue, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn next_valid_string_walks_dictionary() {
        let words: Vec<&[u8]> = vec![b"bat", b"bath", b"cat"];
        let dfa = strings_dfa(words.iter().copied()).unwrap();
        assert_eq!(Some(b"bat".to_vec()), dfa.next_valid_string(b""));
        assert_eq!(Some(b"bat".to_vec()), dfa.next_valid_string(b"bat"));
        assert_eq!(Some(b"bath".to_vec()), dfa.next_valid_string(b"bat\x00"));
        assert_eq!(Some(b"cat".to_vec()), dfa.next_valid_string(b"bb"));
        assert_eq!(None, dfa.next_valid_string(b"cat\x00"));
    }

    #[test]
    fn levenshtein_distance_one() {
        let dfa = lev_dfa(b"cat", 1);
        assert!(dfa.accepts(b"cat")); // exact
        assert!(dfa.accepts(b"car")); // substitution
        assert!(dfa.accepts(b"cart")); // insertion
        assert!(dfa.accepts(b"at")); // deletion
        assert!(dfa.accepts(b"cats")); // append
        assert!(!dfa.accepts(b"dog"));
        assert!(!dfa.accepts(b"ct a"));
        assert!(!dfa.accepts(b"carts"));
    }

    #[test]
    fn levenshtein_prefix_pins_head() {
        let mut dfa = levenshtein_automaton(b"cat", 1, 1).to_dfa();
        dfa.minimize();
        assert!(dfa.accepts(b"cat"));
        assert!(dfa.accepts(b"car"));
        // First byte must match exactly now.
        assert!(!dfa.accepts(b"bat"));
    }

    #[test]
    fn fuzzy_enumeration_over_dictionary() {
        // Seed scenario: dictionary intersected with a k=1 automaton.
        let dictionary: Vec<&[u8]> = vec![b"car", b"cart", b"cat", b"dog"];
        let dfa = lev_dfa(b"cat", 1);

        let lookup = |probe: &[u8]| -> Result<Option<Vec<u8>>, Error> {
            Ok(dictionary
                .iter()
                .find(|t| **t >= probe)
                .map(|t| t.to_vec()))
        };
        let mut matches = FuzzyMatches::new(&dfa, lookup);
        let mut found = Vec::new();
        while let Some(m) = matches.next_match().unwrap() {
            found.push(m);
        }
        assert_eq!(
            vec![b"car".to_vec(), b"cart".to_vec(), b"cat".to_vec()],
            found
        );
        // Exhausted enumerations stay exhausted.
        assert_eq!(None, matches.next_match().unwrap());
    }
}

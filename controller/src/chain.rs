//! Chain resolves multi-step version conversions for CRDs.
//!
//! Hooks declare single conversion steps. A request for a pair of versions no hook declared
//! directly is satisfied by the shortest sequence of declared steps.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use api::ConversionRule;

/// Chain is the graph of declared conversion steps for one CRD.
///
/// Edges are kept in the order they were first added.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Chain {
    edges: Vec<ConversionRule>,
}

impl Chain {
    /// Put adds a step. Adding a step twice has no effect.
    pub fn put(&mut self, rule: ConversionRule) {
        if !self.edges.contains(&rule) {
            self.edges.push(rule);
        }
    }

    /// Edges returns the declared steps.
    pub fn edges(&self) -> &[ConversionRule] {
        &self.edges
    }

    /// Find returns the shortest sequence of steps converting `rule.from_version` to
    /// `rule.to_version`.
    ///
    /// Among paths of equal length, the one using earlier-added edges wins. An empty result
    /// means no conversion is possible, which includes the case of equal versions.
    pub fn find(&self, rule: &ConversionRule) -> Vec<ConversionRule> {
        let from = rule.from_version.as_str();
        let to = rule.to_version.as_str();
        let mut prev: HashMap<&str, &ConversionRule> = HashMap::new();
        let mut seen: HashSet<&str> = HashSet::from([from]);
        let mut queue: VecDeque<&str> = VecDeque::from([from]);

        while let Some(v) = queue.pop_front() {
            if v == to {
                break;
            }
            for e in self.edges.iter().filter(|e| e.from_version == v) {
                let next = e.to_version.as_str();
                if seen.insert(next) {
                    prev.insert(next, e);
                    queue.push_back(next);
                }
            }
        }

        let mut out = Vec::new();
        let mut cur = to;
        while let Some(e) = prev.get(cur) {
            out.push((*e).clone());
            cur = e.from_version.as_str();
        }
        out.reverse();
        out
    }
}

/// ChainStorage holds a [`Chain`] per CRD name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChainStorage {
    chains: BTreeMap<String, Chain>,
}

impl ChainStorage {
    /// Put adds a step for `crd_name`.
    pub fn put<S: Into<String>>(&mut self, crd_name: S, rule: ConversionRule) {
        self.chains.entry(crd_name.into()).or_default().put(rule);
    }

    /// Get returns the chain for `crd_name`.
    pub fn get(&self, crd_name: &str) -> Option<&Chain> {
        self.chains.get(crd_name)
    }

    /// Find_conversion_chain resolves `rule` for `crd_name`.
    ///
    /// Unknown CRDs and unreachable versions both yield an empty chain.
    pub fn find_conversion_chain(
        &self,
        crd_name: &str,
        rule: &ConversionRule,
    ) -> Vec<ConversionRule> {
        self.chains
            .get(crd_name)
            .map(|c| c.find(rule))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CRD: &str = "crontabs.stable.example.com";

    fn r(from: &str, to: &str) -> ConversionRule {
        ConversionRule::new(from, to)
    }

    #[test]
    fn direct_edge_wins() {
        let mut s = ChainStorage::default();
        s.put(CRD, r("v1", "v2"));
        s.put(CRD, r("v2", "v3"));
        s.put(CRD, r("v1", "v3"));
        assert_eq!(s.find_conversion_chain(CRD, &r("v1", "v3")), vec![r("v1", "v3")]);
    }

    #[test]
    fn multi_hop() {
        let mut s = ChainStorage::default();
        s.put(CRD, r("v1", "v2"));
        s.put(CRD, r("v2", "v3"));
        s.put(CRD, r("v3", "v4"));
        s.put(CRD, r("v4", "v3"));
        s.put(CRD, r("v3", "v2"));
        assert_eq!(
            s.find_conversion_chain(CRD, &r("v1", "v4")),
            vec![r("v1", "v2"), r("v2", "v3"), r("v3", "v4")]
        );
        assert_eq!(
            s.find_conversion_chain(CRD, &r("v4", "v2")),
            vec![r("v4", "v3"), r("v3", "v2")]
        );
    }

    #[test]
    fn idempotent_put() {
        let mut s = ChainStorage::default();
        for _ in 0..3 {
            s.put(CRD, r("v1", "v2"));
            s.put(CRD, r("v2", "v3"));
        }
        assert_eq!(s.get(CRD).map(|c| c.edges().len()), Some(2));
        assert_eq!(
            s.find_conversion_chain(CRD, &r("v1", "v3")),
            vec![r("v1", "v2"), r("v2", "v3")]
        );
    }

    #[test]
    fn empty_results() {
        let mut s = ChainStorage::default();
        s.put(CRD, r("v1", "v2"));
        assert!(s.find_conversion_chain("unknown.example.com", &r("v1", "v2")).is_empty());
        assert!(s.find_conversion_chain(CRD, &r("v2", "v1")).is_empty());
        assert!(s.find_conversion_chain(CRD, &r("v1", "v9")).is_empty());
        assert!(s.find_conversion_chain(CRD, &r("v1", "v1")).is_empty());
    }

    #[test]
    fn tie_break_by_insertion() {
        let mut s = ChainStorage::default();
        s.put(CRD, r("v1", "b"));
        s.put(CRD, r("v1", "a"));
        s.put(CRD, r("a", "v2"));
        s.put(CRD, r("b", "v2"));
        assert_eq!(
            s.find_conversion_chain(CRD, &r("v1", "v2")),
            vec![r("v1", "b"), r("b", "v2")]
        );
    }
}

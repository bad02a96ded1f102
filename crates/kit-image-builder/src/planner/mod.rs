use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{Error, Result};

pub type TaskId = String;

pub const IMAGE_BARRIER_ID: &str = "core.barrier.image";

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub label: String,
    pub module: String,
    pub phase: String,
    /// Task ids or provide tokens; a trailing `?` marks the dependency optional.
    pub after: Vec<TaskId>,
    pub provides: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Plan {
    tasks: BTreeMap<TaskId, Task>,
}

/// Dependency edges resolved to concrete task ids.
#[derive(Debug, Default, Clone)]
pub struct Graph {
    pub incoming: BTreeMap<TaskId, usize>,
    pub outgoing: BTreeMap<TaskId, BTreeSet<TaskId>>,
}

impl Plan {
    pub fn add(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::msg(format!("duplicate task id '{}'", task.id)));
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn provides_index(&self) -> Result<BTreeMap<&str, &str>> {
        let mut out: BTreeMap<&str, &str> = BTreeMap::new();
        for (id, task) in &self.tasks {
            for p in &task.provides {
                if let Some(existing) = out.insert(p.as_str(), id.as_str()) {
                    return Err(Error::msg(format!(
                        "provide token '{p}' is produced by both '{existing}' and '{id}'"
                    )));
                }
            }
        }
        Ok(out)
    }

    fn resolve_dep<'a>(
        &'a self,
        provides: &BTreeMap<&'a str, &'a str>,
        dep: &'a str,
    ) -> Result<Option<&'a str>> {
        let (dep, optional) = match dep.strip_suffix('?') {
            Some(d) => (d, true),
            None => (dep, false),
        };
        if let Some((id, _)) = self.tasks.get_key_value(dep) {
            return Ok(Some(id.as_str()));
        }
        if let Some(&provider) = provides.get(dep) {
            return Ok(Some(provider));
        }
        if optional {
            Ok(None)
        } else {
            Err(Error::msg(format!("unknown dependency '{dep}'")))
        }
    }

    pub fn graph(&self) -> Result<Graph> {
        let provides = self.provides_index()?;
        let mut g = Graph::default();
        for id in self.tasks.keys() {
            g.incoming.insert(id.clone(), 0);
            g.outgoing.entry(id.clone()).or_default();
        }
        for (id, task) in &self.tasks {
            for dep in &task.after {
                let resolved = self.resolve_dep(&provides, dep).map_err(|e| {
                    Error::msg(format!("task '{id}' has invalid dependency '{dep}': {e}"))
                })?;
                let Some(dep_id) = resolved else {
                    continue;
                };
                if g.outgoing
                    .entry(dep_id.to_string())
                    .or_default()
                    .insert(id.clone())
                    && let Some(n) = g.incoming.get_mut(id)
                {
                    *n += 1;
                }
            }
        }
        Ok(g)
    }

    pub fn ordered(&self) -> Result<Vec<&Task>> {
        let Graph {
            mut incoming,
            outgoing,
        } = self.graph()?;

        let mut q: VecDeque<TaskId> = incoming
            .iter()
            .filter_map(|(k, v)| (*v == 0).then(|| k.clone()))
            .collect();
        let mut out: Vec<&Task> = Vec::with_capacity(self.tasks.len());

        while let Some(n) = q.pop_front() {
            if let Some(task) = self.tasks.get(&n) {
                out.push(task);
            }
            for m in outgoing.get(&n).into_iter().flatten() {
                if let Some(slot) = incoming.get_mut(m) {
                    *slot -= 1;
                    if *slot == 0 {
                        q.push_back(m.clone());
                    }
                }
            }
        }

        if out.len() != self.tasks.len() {
            let remaining: Vec<&str> = incoming
                .iter()
                .filter_map(|(k, v)| (*v > 0).then_some(k.as_str()))
                .collect();
            return Err(Error::msg(format!(
                "task graph contains a cycle; remaining nodes: {}",
                remaining.join(", ")
            )));
        }
        Ok(out)
    }

    pub fn finalize_default(&mut self) -> Result<()> {
        self.add_image_barrier()
    }

    // Every task providing an `image:` token mutates the work image. The barrier lets
    // consumers (output.compress) wait on "image:done" without naming each producer.
    fn add_image_barrier(&mut self) -> Result<()> {
        if self.tasks.contains_key(IMAGE_BARRIER_ID) {
            return Ok(());
        }

        let deps: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.provides.iter().any(|p| p.starts_with("image:")))
            .map(|t| t.id.clone())
            .collect();

        self.add(Task {
            id: IMAGE_BARRIER_ID.into(),
            label: "Image barrier".into(),
            module: "core".into(),
            phase: "barrier".into(),
            after: deps,
            provides: vec!["image:done".into()],
        })
    }

    pub fn to_dot(&self) -> Result<String> {
        let g = self.graph()?;
        let mut out = String::from("digraph plan {\n  rankdir=LR;\n");
        for task in self.tasks.values() {
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{}:{}\"];\n",
                task.id, task.label, task.module, task.phase
            ));
        }
        for (from, tos) in &g.outgoing {
            for to in tos {
                out.push_str(&format!("  \"{from}\" -> \"{to}\";\n"));
            }
        }
        out.push_str("}\n");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, after: &[&str], provides: &[&str]) -> Task {
        Task {
            id: id.into(),
            label: id.into(),
            module: "test".into(),
            phase: "test".into(),
            after: after.iter().map(|s| s.to_string()).collect(),
            provides: provides.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn orders_by_tokens_and_skips_missing_optional_deps() {
        let mut plan = Plan::default();
        plan.add(task("b", &["tok:a", "tok:absent?"], &["image:b"]))
            .unwrap();
        plan.add(task("a", &[], &["tok:a"])).unwrap();
        plan.add(task("c", &["image:done"], &[])).unwrap();
        plan.finalize_default().unwrap();

        let ids: Vec<&str> = plan.ordered().unwrap().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", IMAGE_BARRIER_ID, "c"]);
    }

    #[test]
    fn rejects_unknown_required_dep_and_cycles() {
        let mut plan = Plan::default();
        plan.add(task("a", &["nope"], &[])).unwrap();
        let err = plan.ordered().unwrap_err().to_string();
        assert!(err.contains("unknown dependency 'nope'"), "{err}");

        let mut plan = Plan::default();
        plan.add(task("a", &["b"], &[])).unwrap();
        plan.add(task("b", &["a"], &[])).unwrap();
        let err = plan.ordered().unwrap_err().to_string();
        assert!(err.contains("cycle"), "{err}");
    }

    #[test]
    fn rejects_duplicate_provide_tokens() {
        let mut plan = Plan::default();
        plan.add(task("a", &[], &["x"])).unwrap();
        plan.add(task("b", &[], &["x"])).unwrap();
        assert!(plan.ordered().is_err());
    }
}

use std::collections::{HashMap, HashSet};

use crate::transport::{ClassRef, ObjectRef};

/// Classes resolved under the current user class loader.
///
/// Every new loader starts a new generation and forgets what the previous one
/// resolved, so a stale `ClassRef` from an earlier compile is never handed out.
#[derive(Debug, Default)]
pub(crate) struct LoaderArena {
    generation: u64,
    loader: Option<ObjectRef>,
    /// User loaders of earlier generations. Their classes are dead.
    retired: HashSet<ObjectRef>,
    classes: HashMap<String, ClassRef>,
}

impl LoaderArena {
    pub fn begin_generation(&mut self, loader: ObjectRef) -> u64 {
        if let Some(previous) = self.loader.replace(loader) {
            if previous != loader {
                self.retired.insert(previous);
            }
        }
        self.generation += 1;
        self.classes.clear();
        self.generation
    }

    pub fn get(&self, name: &str) -> Option<&ClassRef> {
        self.classes.get(name)
    }

    pub fn remember(&mut self, class: ClassRef) {
        self.classes.insert(class.name.clone(), class);
    }

    /// Picks the class a lookup by name should mean.
    ///
    /// Classes of retired loaders never qualify. A single remaining candidate
    /// is unambiguous (it may come from a parent of the user loader); with
    /// several, only the one defined by the current user loader qualifies.
    pub fn choose(&self, candidates: Vec<ClassRef>) -> Option<ClassRef> {
        let mut live: Vec<ClassRef> = candidates
            .into_iter()
            .filter(|class| !self.retired.contains(&class.loader))
            .collect();
        if live.len() == 1 {
            return live.pop();
        }
        let loader = self.loader?;
        live.into_iter().find(|class| class.loader == loader)
    }
}

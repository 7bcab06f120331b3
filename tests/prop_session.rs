use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use proptest::prelude::*;

use stratadb::{KeyValue, MemoryStore, Session, SharedBytes};

const KEY_SPACE: u8 = 6;

#[derive(Debug, Clone)]
enum Step {
    Write { key: u8, value: u8 },
    Erase { key: u8 },
    Nest,
    Commit,
    Undo,
}

fn key_bytes(key: u8) -> Vec<u8> {
    vec![b'a' + key % KEY_SPACE]
}

fn value_bytes(value: u8) -> Vec<u8> {
    vec![b'0' + value % 10]
}

/// One reference layer: authored entries plus tombstones.
#[derive(Debug, Default, Clone)]
struct ModelLayer {
    written: BTreeMap<Vec<u8>, Vec<u8>>,
    deleted: BTreeSet<Vec<u8>>,
}

/// Reference model: a base map under a stack of layers.
struct Model {
    base: BTreeMap<Vec<u8>, Vec<u8>>,
    layers: Vec<ModelLayer>,
}

impl Model {
    fn new() -> Self {
        Self {
            base: BTreeMap::new(),
            layers: vec![ModelLayer::default()],
        }
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        for layer in self.layers.iter().rev() {
            if layer.deleted.contains(key) {
                return None;
            }
            if let Some(value) = layer.written.get(key) {
                return Some(value.clone());
            }
        }
        self.base.get(key).cloned()
    }

    fn merged(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        (0..KEY_SPACE)
            .filter_map(|k| {
                let key = key_bytes(k);
                self.get(&key).map(|value| (key, value))
            })
            .collect()
    }

    fn commit_top(&mut self) {
        let top = self.layers.pop().expect("model layer");
        match self.layers.last_mut() {
            Some(parent) => {
                for key in &top.deleted {
                    parent.written.remove(key);
                    parent.deleted.insert(key.clone());
                }
                for (key, value) in &top.written {
                    parent.deleted.remove(key);
                    parent.written.insert(key.clone(), value.clone());
                }
            }
            None => {
                for key in &top.deleted {
                    self.base.remove(key);
                }
                for (key, value) in &top.written {
                    self.base.insert(key.clone(), value.clone());
                }
                self.layers.push(ModelLayer::default());
            }
        }
    }
}

/// Forward walk collecting each merged entry until the cursor reaches the
/// end sentinel.
fn collect_forward(session: &Session) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut out = Vec::new();
    let mut iter = session.begin()?;
    while !iter.is_end() {
        let entry = iter.entry()?;
        out.push((
            entry.key().as_slice().to_vec(),
            entry.value().as_slice().to_vec(),
        ));
        iter.step_next()?;
    }
    Ok(out)
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (0..KEY_SPACE, any::<u8>()).prop_map(|(key, value)| Step::Write { key, value }),
        2 => (0..KEY_SPACE).prop_map(|key| Step::Erase { key }),
        1 => Just(Step::Nest),
        1 => Just(Step::Commit),
        1 => Just(Step::Undo),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

    #[test]
    fn session_stack_matches_reference_model(steps in prop::collection::vec(step_strategy(), 1..48)) {
        let store = Rc::new(MemoryStore::new());
        let mut sessions = vec![Session::new(store)];
        let mut model = Model::new();

        for step in &steps {
            match step {
                Step::Write { key, value } => {
                    let kb = key_bytes(*key);
                    let vb = value_bytes(*value);
                    sessions
                        .last()
                        .unwrap()
                        .write(KeyValue::new(kb.as_slice(), vb.as_slice()))
                        .unwrap();
                    let top = model.layers.last_mut().unwrap();
                    top.deleted.remove(&kb);
                    top.written.insert(kb, vb);
                }
                Step::Erase { key } => {
                    let kb = key_bytes(*key);
                    sessions
                        .last()
                        .unwrap()
                        .erase(&SharedBytes::from(kb.as_slice()))
                        .unwrap();
                    let top = model.layers.last_mut().unwrap();
                    top.written.remove(&kb);
                    top.deleted.insert(kb);
                }
                Step::Nest => {
                    let tip = sessions.last().unwrap().nest();
                    sessions.push(tip);
                    model.layers.push(ModelLayer::default());
                }
                Step::Commit => {
                    sessions.last().unwrap().commit().unwrap();
                    if sessions.len() > 1 {
                        sessions.pop();
                    }
                    model.commit_top();
                }
                Step::Undo => {
                    if sessions.len() > 1 {
                        sessions.last().unwrap().undo();
                        sessions.pop();
                        model.layers.pop();
                    }
                }
            }

            // Point reads and membership agree with the model for every
            // key after every step.
            let tip = sessions.last().unwrap();
            for k in 0..KEY_SPACE {
                let kb = key_bytes(k);
                let sk = SharedBytes::from(kb.as_slice());
                let expected = model.get(&kb);
                let got = tip.read(&sk).unwrap();
                prop_assert_eq!(got.is_valid(), expected.is_some());
                if let Some(expected_value) = &expected {
                    prop_assert_eq!(got.value().as_slice(), expected_value.as_slice());
                }
                prop_assert_eq!(tip.contains(&sk).unwrap(), expected.is_some());
            }

            // Full ordered iteration agrees with the model's merged view.
            prop_assert_eq!(collect_forward(tip).unwrap(), model.merged());
        }
    }
}

// Copyright 2025 RustFS Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Watch-fed object caches that report what changed.

use futures::StreamExt;
use kube::Resource;
use kube::api::Api;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{WatchStreamExt, watcher};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A change to a cached object.
#[derive(Debug, Clone)]
pub enum Change<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(Arc<K>),
}

/// Keeps a reflector store in sync with a watch and translates raw watch
/// events into [`Change`]s.
///
/// Objects that disappear across a re-list are reported as deleted once the
/// re-list completes.
pub struct Informer<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    writer: Writer<K>,
    store: Store<K>,
    relist: Option<Vec<Arc<K>>>,
}

impl<K> Default for Informer<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Informer<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    pub fn new() -> Self {
        let writer = Writer::default();
        let store = writer.as_reader();
        Self {
            writer,
            store,
            relist: None,
        }
    }

    /// Read handle on the cache.
    pub fn store(&self) -> Store<K> {
        self.store.clone()
    }

    pub fn apply(&mut self, event: watcher::Event<K>) -> Vec<Change<K>> {
        match &event {
            watcher::Event::Apply(obj) => {
                let key = ObjectRef::from_obj(obj);
                let old = self.store.get(&key);
                self.writer.apply_watcher_event(&event);
                let new = self
                    .store
                    .get(&key)
                    .unwrap_or_else(|| Arc::new(obj.clone()));

                match old {
                    Some(old) => vec![Change::Updated { old, new }],
                    None => vec![Change::Added(new)],
                }
            }
            watcher::Event::Delete(obj) => {
                let old = self.store.get(&ObjectRef::from_obj(obj));
                self.writer.apply_watcher_event(&event);
                vec![Change::Deleted(old.unwrap_or_else(|| Arc::new(obj.clone())))]
            }
            watcher::Event::Init => {
                self.relist = Some(Vec::new());
                self.writer.apply_watcher_event(&event);
                Vec::new()
            }
            watcher::Event::InitApply(obj) => {
                self.relist
                    .get_or_insert_with(Vec::new)
                    .push(Arc::new(obj.clone()));
                self.writer.apply_watcher_event(&event);
                Vec::new()
            }
            watcher::Event::InitDone => {
                let mut previous: HashMap<ObjectRef<K>, Arc<K>> = self
                    .store
                    .state()
                    .into_iter()
                    .map(|obj| (ObjectRef::from_obj(&*obj), obj))
                    .collect();
                self.writer.apply_watcher_event(&event);

                let listed = self.relist.take().unwrap_or_default();
                let mut changes = Vec::with_capacity(listed.len());
                for obj in listed {
                    let key = ObjectRef::from_obj(&*obj);
                    let new = self.store.get(&key).unwrap_or(obj);
                    match previous.remove(&key) {
                        Some(old) => changes.push(Change::Updated { old, new }),
                        None => changes.push(Change::Added(new)),
                    }
                }
                changes.extend(previous.into_values().map(Change::Deleted));
                changes
            }
        }
    }
}

impl<K> Informer<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    /// Watches `api` until `token` is cancelled, passing every change to
    /// `handler`.
    pub async fn run<F>(
        mut self,
        api: Api<K>,
        config: watcher::Config,
        token: CancellationToken,
        mut handler: F,
    ) where
        F: FnMut(Change<K>) + Send,
    {
        let stream = watcher(api, config).default_backoff();
        futures::pin_mut!(stream);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = stream.next() => match event {
                    Some(Ok(event)) => {
                        for change in self.apply(event) {
                            handler(change);
                        }
                    }
                    Some(Err(e)) => warn!("watch {} failed: {}", K::kind(&Default::default()), e),
                    None => break,
                },
            }
        }

        debug!("watch {} stopped", K::kind(&Default::default()));
    }
}

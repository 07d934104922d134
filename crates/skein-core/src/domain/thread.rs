//! Thread state container.
//!
//! メッセージ列と metadata は 1 つの `RwLock` の下で `Arc` として保持します。
//!
//! ## 書き込み（copy-on-write）
//! 書き込み側は現在の backing storage を直接変更しません。新しい `Vec` / map を
//! 作り、write lock を保持したまま `Arc` を差し替えます。
//!
//! ## 読み取り
//! 読み取り側は read lock の下で `Arc` を取得し、lock を外してからコピーします。
//! そのため、書き込み途中の状態を観測することはありません。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::context::RunContext;
use super::ids::ThreadId;
use super::message::Message;
use super::metadata::{MergeOptions, Metadata};

#[derive(Debug, Clone, Default)]
struct Storage {
    messages: Arc<Vec<Message>>,
    metadata: Arc<Metadata>,
}

#[derive(Debug)]
pub struct Thread {
    id: ThreadId,
    ctx: RunContext,
    storage: RwLock<Storage>,
}

/// ある時点の thread のシリアライズ可能なコピー
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadSnapshot {
    pub id: ThreadId,
    pub messages: Vec<Message>,
    pub metadata: Metadata,
    pub taken_at: DateTime<Utc>,
}

impl Thread {
    pub fn new(ctx: RunContext) -> Self {
        Self {
            id: ThreadId::generate(),
            ctx,
            storage: RwLock::new(Storage::default()),
        }
    }

    pub fn from_messages(ctx: RunContext, messages: Vec<Message>) -> Self {
        Self::new(ctx).with_messages(messages)
    }

    fn from_parts(id: ThreadId, ctx: RunContext, storage: Storage) -> Self {
        Self {
            id,
            ctx,
            storage: RwLock::new(storage),
        }
    }

    fn storage(&self) -> Storage {
        self.storage.read().clone()
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn context(&self) -> RunContext {
        self.ctx.clone()
    }

    /// clone せずに context を借用する（composite のホットパス用）
    pub fn ctx(&self) -> &RunContext {
        &self.ctx
    }

    pub fn messages(&self) -> Vec<Message> {
        let messages = Arc::clone(&self.storage.read().messages);
        messages.as_ref().clone()
    }

    pub fn message_count(&self) -> usize {
        self.storage.read().messages.len()
    }

    pub fn last_message(&self) -> Option<Message> {
        let messages = Arc::clone(&self.storage.read().messages);
        messages.last().cloned()
    }

    pub fn metadata(&self) -> Metadata {
        let metadata = Arc::clone(&self.storage.read().metadata);
        metadata.as_ref().clone()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let metadata = Arc::clone(&self.storage.read().metadata);
        metadata.get(key).cloned()
    }

    /// その場で追加する。以前の backing `Vec` は変更しない
    pub fn append_messages<I>(&self, messages: I)
    where
        I: IntoIterator<Item = Message>,
    {
        let incoming: Vec<Message> = messages.into_iter().collect();
        if incoming.is_empty() {
            return;
        }
        let mut storage = self.storage.write();
        let mut next = Vec::with_capacity(storage.messages.len() + incoming.len());
        next.extend(storage.messages.iter().cloned());
        next.extend(incoming);
        storage.messages = Arc::new(next);
    }

    pub fn append_message(&self, message: Message) {
        self.append_messages([message]);
    }

    /// metadata を 1 件その場で設定する（copy-on-write）
    pub fn set(&self, key: impl Into<String>, value: Value) {
        let mut storage = self.storage.write();
        let mut next = storage.metadata.as_ref().clone();
        next.insert(key, value);
        storage.metadata = Arc::new(next);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        let mut storage = self.storage.write();
        if !storage.metadata.contains_key(key) {
            return None;
        }
        let mut next = storage.metadata.as_ref().clone();
        let removed = next.remove(key);
        storage.metadata = Arc::new(next);
        removed
    }

    /// `incoming` をこの thread の metadata にその場でマージする
    pub fn merge_metadata(&self, incoming: &Metadata, options: &MergeOptions) {
        let mut storage = self.storage.write();
        let mut next = storage.metadata.as_ref().clone();
        next.merge(incoming, options);
        storage.metadata = Arc::new(next);
    }

    pub fn with_context(&self, ctx: RunContext) -> Thread {
        Self::from_parts(self.id, ctx, self.storage())
    }

    pub fn with_id(&self, id: ThreadId) -> Thread {
        Self::from_parts(id, self.ctx.clone(), self.storage())
    }

    pub fn with_messages(&self, messages: Vec<Message>) -> Thread {
        let mut storage = self.storage();
        storage.messages = Arc::new(messages);
        Self::from_parts(self.id, self.ctx.clone(), storage)
    }

    pub fn with_metadata(&self, metadata: Metadata) -> Thread {
        let mut storage = self.storage();
        storage.metadata = Arc::new(metadata);
        Self::from_parts(self.id, self.ctx.clone(), storage)
    }

    pub fn snapshot(&self) -> ThreadSnapshot {
        let storage = self.storage();
        ThreadSnapshot {
            id: self.id,
            messages: storage.messages.as_ref().clone(),
            metadata: storage.metadata.as_ref().clone(),
            taken_at: Utc::now(),
        }
    }
}

impl Default for Thread {
    fn default() -> Self {
        Self::new(RunContext::new())
    }
}

/// 独立したコンテナを返す
///
/// 公開済みの backing storage は不変なので `Arc` を共有しても安全です。
/// 以後どちらかに書き込むと、共有中の storage ではなく新しい storage に差し替わります。
impl Clone for Thread {
    fn clone(&self) -> Self {
        Self::from_parts(self.id, self.ctx.clone(), self.storage())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seeded() -> Thread {
        let thread = Thread::from_messages(RunContext::new(), vec![Message::user("hello")]);
        thread.set("topic", json!("weather"));
        thread
    }

    #[test]
    fn reads_return_independent_copies() {
        let thread = seeded();
        let mut messages = thread.messages();
        messages.push(Message::assistant("not stored"));
        let mut meta = thread.metadata();
        meta.insert("topic", json!("changed"));

        assert_eq!(thread.message_count(), 1);
        assert_eq!(thread.get("topic"), Some(json!("weather")));
    }

    #[test]
    fn append_and_set_mutate_in_place() {
        let thread = seeded();
        thread.append_messages(vec![Message::assistant("hi"), Message::user("more")]);
        thread.set("turn", json!(2));

        let contents: Vec<String> = thread
            .messages()
            .iter()
            .map(|m| m.content().to_string())
            .collect();
        assert_eq!(contents, vec!["hello", "hi", "more"]);
        assert_eq!(thread.get("turn"), Some(json!(2)));
    }

    #[test]
    fn with_messages_preserves_identity_and_isolates() {
        let original = seeded();
        let derived = original.with_messages(vec![Message::system("rules")]);

        assert_eq!(derived.id(), original.id());
        assert_eq!(derived.get("topic"), Some(json!("weather")));

        original.set("topic", json!("sports"));
        original.append_message(Message::assistant("late"));
        derived.set("extra", json!(true));

        assert_eq!(derived.get("topic"), Some(json!("weather")));
        assert_eq!(derived.message_count(), 1);
        assert_eq!(original.get("extra"), None);
        assert_eq!(original.message_count(), 2);
    }

    #[test]
    fn with_metadata_preserves_identity_and_isolates() {
        let original = seeded();
        let derived = original.with_metadata(Metadata::new());

        assert_eq!(derived.id(), original.id());
        assert!(derived.metadata().is_empty());

        derived.append_message(Message::assistant("only in derived"));
        assert_eq!(original.message_count(), 1);
        assert_eq!(derived.message_count(), 2);
    }

    #[test]
    fn with_context_preserves_identity_and_swaps_carrier() {
        let original = seeded();
        let ctx = RunContext::new();
        let derived = original.with_context(ctx.clone());
        ctx.cancel();

        assert_eq!(derived.id(), original.id());
        assert!(derived.ctx().is_done());
        assert!(!original.ctx().is_done());
    }

    #[test]
    fn with_id_replaces_identity_only() {
        let original = seeded();
        let id = ThreadId::generate();
        let derived = original.with_id(id);

        assert_eq!(derived.id(), id);
        assert_ne!(derived.id(), original.id());
        assert_eq!(derived.messages(), original.messages());
    }

    #[test]
    fn clone_is_independent() {
        let original = seeded();
        let copy = original.clone();
        copy.append_message(Message::assistant("copy only"));
        copy.set("topic", json!("copy"));

        assert_eq!(original.message_count(), 1);
        assert_eq!(original.get("topic"), Some(json!("weather")));
        assert_eq!(copy.id(), original.id());
    }

    #[test]
    fn remove_returns_previous_value() {
        let thread = seeded();
        assert_eq!(thread.remove("topic"), Some(json!("weather")));
        assert_eq!(thread.remove("topic"), None);
    }

    #[test]
    fn concurrent_readers_never_see_partial_or_shrinking_state() {
        let thread = Arc::new(Thread::default());
        let writer = {
            let thread = Arc::clone(&thread);
            std::thread::spawn(move || {
                for i in 0..500 {
                    thread.append_messages(vec![
                        Message::user(format!("{i}-a")),
                        Message::assistant(format!("{i}-b")),
                    ]);
                    thread.set("n", json!(i));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let thread = Arc::clone(&thread);
                std::thread::spawn(move || {
                    let mut last_len = 0;
                    let mut last_n = -1;
                    for _ in 0..500 {
                        let messages = thread.messages();
                        // pairs are appended atomically
                        assert_eq!(messages.len() % 2, 0);
                        assert!(messages.len() >= last_len);
                        last_len = messages.len();

                        let n = thread
                            .metadata()
                            .get("n")
                            .map_or(-1, |v| v.as_i64().unwrap());
                        assert!(n >= last_n, "n went from {last_n} to {n}");
                        last_n = n;
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(thread.message_count(), 1000);
        assert_eq!(thread.get("n"), Some(json!(499)));
    }

    #[test]
    fn snapshot_serializes() {
        let snapshot = seeded().snapshot();
        let text = serde_json::to_string(&snapshot).unwrap();
        let back: ThreadSnapshot = serde_json::from_str(&text).unwrap();
        assert_eq!(back.id, snapshot.id);
        assert_eq!(back.messages.len(), 1);
        assert_eq!(back.metadata.get("topic"), Some(&json!("weather")));
    }
}

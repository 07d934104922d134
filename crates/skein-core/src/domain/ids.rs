//! Domain identifiers (strongly-typed IDs).
//!
//! ULID を Phantom type 付きの `Id<T>` で包んだ型付き ID です。
//!
//! ## ULID の特性
//! - **時刻でソート可能**: 生成順に並ぶので、ログ出力の順序が安定する
//! - **調整不要**: 複数タスクから同時に生成しても衝突しない
//!
//! `T` は実行時には使わないマーカー型で、異なる種類の ID を
//! コンパイル時に取り違えられないようにします。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// 各 ID 型のマーカー trait
///
/// Display で使うプレフィックス（例: "thread-"）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// 新しい ID を生成
    pub fn generate() -> Self {
        Self::from_ulid(Ulid::new())
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ulid::DecodeError;

    /// プレフィックス付きの表示形式と、素の ULID の両方を受け付ける
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw).map(Self::from_ulid)
    }
}

/// Thread ID のマーカー
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ThreadMarker {}

impl IdMarker for ThreadMarker {
    fn prefix() -> &'static str {
        "thread-"
    }
}

/// 会話 thread の ID
///
/// 派生コピー（`with_messages` など）でも変わりません。
pub type ThreadId = Id<ThreadMarker>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_ids_display_with_prefix() {
        let id = ThreadId::generate();
        assert!(id.to_string().starts_with("thread-"));
    }

    #[test]
    fn generated_ids_are_unique_and_sortable() {
        let id1 = ThreadId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = ThreadId::generate();

        assert_ne!(id1, id2);
        assert!(id1 < id2);
    }

    #[test]
    fn parses_prefixed_and_bare_forms() {
        let id = ThreadId::generate();
        let prefixed: ThreadId = id.to_string().parse().unwrap();
        let bare: ThreadId = id.as_ulid().to_string().parse().unwrap();
        assert_eq!(prefixed, id);
        assert_eq!(bare, id);
        assert!("thread-not-a-ulid".parse::<ThreadId>().is_err());
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        assert_eq!(std::mem::size_of::<ThreadId>(), std::mem::size_of::<Ulid>());
    }
}

//! JobKind trait - 型付き Job の定義
//!
//! # 学習ポイント
//! - Associated Constants (`const KIND`)
//! - Trait bounds の組み合わせ (Serialize + DeserializeOwned + Send + Sync + 'static)

use serde::Serialize;
use serde::de::DeserializeOwned;

/// JobKind は kind 文字列と payload の型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct ResizeImage {
///     path: String,
///     width: u32,
/// }
///
/// impl JobKind for ResizeImage {
///     const KIND: &'static str = "media.resize_image.v1";
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize`: enqueue 時に payload へ変換するため
/// - `DeserializeOwned`: worker 側で payload から復元するため
/// - `Send + Sync + 'static`: spawn したタスクへ渡すため
pub trait JobKind: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// kind の定義
    ///
    /// # 命名規約
    /// - `{domain}.{action}.v{major}`
    /// - 例: `billing.charge.v1`
    const KIND: &'static str;
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::JobKind;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Add {
        pub a: i64,
        pub b: i64,
    }

    impl JobKind for Add {
        const KIND: &'static str = "test.add.v1";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Greet {
        pub name: String,
    }

    impl JobKind for Greet {
        const KIND: &'static str = "test.greet.v1";
    }
}

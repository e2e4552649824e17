//! Handler - ジョブロジックと入力マージのプラグイン層
//!
//! # 設計原則
//! - プラグインは名前 → ファクトリの表で解決する（起動時に登録）
//! - 実行時に名前が解決できない場合は、そのジョブだけが FAILED になる
//! - ハンドラは試行ごとに新しいインスタンスを使う

pub mod handler;
pub mod merger;
pub mod registry;

pub use self::handler::{HandlerError, NamedHandler, WorkContext, WorkHandler};
pub use self::merger::{ArrayCreatingInputMerger, InputMerger, MergerRegistry, OverwritingInputMerger};
pub use self::registry::{HandlerFactory, HandlerRegistry, RegistryError};

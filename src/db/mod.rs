//! Transactions and storage.
//!
//! [`TransactionManager::run`] executes a unit of work so that every repository call
//! inside it commits or rolls back together. The open transaction travels with the task
//! in a task-local, so repositories and nested `run` calls find it without any handle
//! being passed around: a nested call opens a savepoint instead of a second transaction.
//! Work spawned onto another task starts outside the transaction.

pub mod memory;
pub mod postgres;
mod repos;

pub use repos::{CoordinateRepo, DriverRepo, NearbyDriver, RideRepo, SessionRepo, UserRepo};

use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxOptions {
    pub isolation: Option<IsolationLevel>,
    pub read_only: bool,
}

impl TxOptions {
    /// Same options with the access mode switched to read-only.
    pub fn read_only(self) -> Self {
        Self {
            read_only: true,
            ..self
        }
    }
}

#[async_trait]
pub trait TxBackend: Send + Sync {
    async fn begin(&self, options: TxOptions) -> Result<Arc<dyn Transaction>>;
}

#[async_trait]
pub trait Transaction: Send + Sync + 'static {
    async fn savepoint(&self, name: &str) -> Result<()>;
    async fn rollback_to_savepoint(&self, name: &str) -> Result<()>;
    async fn release_savepoint(&self, name: &str) -> Result<()>;
    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;

    /// Lets a repository recover its own concrete transaction type.
    fn as_any(&self) -> &dyn Any;
}

#[derive(Clone)]
struct TxScope {
    tx: Arc<dyn Transaction>,
    savepoints: Arc<AtomicU32>,
}

tokio::task_local! {
    static CURRENT: TxScope;
}

/// The transaction the current task is running in, if any.
pub fn current_transaction() -> Option<Arc<dyn Transaction>> {
    CURRENT.try_with(|scope| scope.tx.clone()).ok()
}

pub fn in_transaction() -> bool {
    CURRENT.try_with(|_| ()).is_ok()
}

/// Every repository plus the transaction manager that spans them.
#[derive(Clone)]
pub struct Store {
    pub drivers: Arc<dyn DriverRepo>,
    pub rides: Arc<dyn RideRepo>,
    pub sessions: Arc<dyn SessionRepo>,
    pub coordinates: Arc<dyn CoordinateRepo>,
    pub users: Arc<dyn UserRepo>,
    pub tx: TransactionManager,
}

#[derive(Clone)]
pub struct TransactionManager {
    backend: Arc<dyn TxBackend>,
    defaults: TxOptions,
}

impl TransactionManager {
    pub fn new(backend: Arc<dyn TxBackend>) -> Self {
        Self {
            backend,
            defaults: TxOptions::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: TxOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn defaults(&self) -> TxOptions {
        self.defaults
    }

    pub async fn run<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_with(self.defaults, f).await
    }

    pub async fn run_read_only<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_with(self.defaults.read_only(), f).await
    }

    /// Options only apply when this call opens the transaction; a nested call joins the
    /// outer one through a savepoint and inherits its access mode.
    pub async fn run_with<T, F, Fut>(&self, options: TxOptions, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match CURRENT.try_with(|scope| scope.clone()) {
            Ok(scope) => run_nested(scope, f).await,
            Err(_) => self.run_top_level(options, f).await,
        }
    }

    async fn run_top_level<T, F, Fut>(&self, options: TxOptions, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let tx = self.backend.begin(options).await?;
        let scope = TxScope {
            tx: tx.clone(),
            savepoints: Arc::new(AtomicU32::new(0)),
        };

        let outcome = AssertUnwindSafe(CURRENT.scope(scope, async move { f().await }))
            .catch_unwind()
            .await;

        match outcome {
            Err(panic) => {
                if let Err(err) = tx.rollback().await {
                    tracing::error!(error = %err, "rollback after panic failed");
                }
                std::panic::resume_unwind(panic)
            }
            Ok(Err(err)) => match tx.rollback().await {
                Ok(()) => Err(err),
                Err(rollback) => Err(Error::Transaction {
                    source: Box::new(err),
                    rollback: Box::new(rollback),
                }),
            },
            Ok(Ok(value)) => {
                tx.commit().await?;
                Ok(value)
            }
        }
    }
}

async fn run_nested<T, F, Fut>(scope: TxScope, f: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let name = format!("sp_{}", scope.savepoints.fetch_add(1, Ordering::SeqCst) + 1);
    scope.tx.savepoint(&name).await?;

    let outcome = AssertUnwindSafe(f()).catch_unwind().await;

    match outcome {
        Err(panic) => {
            if let Err(err) = scope.tx.rollback_to_savepoint(&name).await {
                tracing::error!(error = %err, savepoint = %name, "rollback to savepoint after panic failed");
            }
            std::panic::resume_unwind(panic)
        }
        Ok(Err(err)) => match scope.tx.rollback_to_savepoint(&name).await {
            Ok(()) => Err(err),
            Err(rollback) => Err(Error::Transaction {
                source: Box::new(err),
                rollback: Box::new(rollback),
            }),
        },
        Ok(Ok(value)) => {
            scope.tx.release_savepoint(&name).await?;
            Ok(value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::{MemoryTxBackend, TxOp};
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn manager() -> (TransactionManager, Arc<MemoryTxBackend>) {
        let backend = Arc::new(MemoryTxBackend::detached());
        (TransactionManager::new(backend.clone()), backend)
    }

    #[tokio::test]
    async fn commits_on_success() {
        let (tm, backend) = manager();

        let value = tm
            .run(|| async {
                assert!(in_transaction());
                Ok(7)
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert!(!in_transaction());
        assert_eq!(
            backend.journal(),
            vec![TxOp::Begin(TxOptions::default()), TxOp::Commit]
        );
    }

    #[tokio::test]
    async fn rolls_back_and_returns_the_error() {
        let (tm, backend) = manager();

        let err = tm
            .run(|| async { Err::<(), _>(Error::DriverRideMismatch) })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::DriverRideMismatch));
        assert_eq!(
            backend.journal(),
            vec![TxOp::Begin(TxOptions::default()), TxOp::Rollback]
        );
    }

    #[tokio::test]
    async fn nested_run_uses_a_savepoint() {
        let (tm, backend) = manager();

        tm.run(|| async {
            tm.run(|| async { Ok(()) }).await?;
            tm.run(|| async { Ok(()) }).await
        })
        .await
        .unwrap();

        assert_eq!(
            backend.journal(),
            vec![
                TxOp::Begin(TxOptions::default()),
                TxOp::Savepoint("sp_1".into()),
                TxOp::Release("sp_1".into()),
                TxOp::Savepoint("sp_2".into()),
                TxOp::Release("sp_2".into()),
                TxOp::Commit,
            ]
        );
    }

    #[tokio::test]
    async fn inner_error_rolls_back_savepoint_and_outer() {
        let (tm, backend) = manager();

        let err = tm
            .run(|| async {
                tm.run(|| async { Err::<(), _>(Error::DriverNotAvailable) })
                    .await?;
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::DriverNotAvailable));

        let journal = backend.journal();
        let begins = journal
            .iter()
            .filter(|op| matches!(op, TxOp::Begin(_)))
            .count();
        assert_eq!(begins, 1);
        assert_eq!(
            journal,
            vec![
                TxOp::Begin(TxOptions::default()),
                TxOp::Savepoint("sp_1".into()),
                TxOp::RollbackTo("sp_1".into()),
                TxOp::Rollback,
            ]
        );
    }

    #[tokio::test]
    async fn read_only_keeps_configured_isolation() {
        let backend = Arc::new(MemoryTxBackend::detached());
        let defaults = TxOptions {
            isolation: Some(IsolationLevel::Serializable),
            read_only: false,
        };
        let tm = TransactionManager::new(backend.clone()).with_defaults(defaults);

        tm.run_read_only(|| async { Ok(()) }).await.unwrap();

        assert_eq!(
            backend.journal()[0],
            TxOp::Begin(TxOptions {
                isolation: Some(IsolationLevel::Serializable),
                read_only: true,
            })
        );
        assert!(!tm.defaults().read_only);
    }

    #[tokio::test]
    async fn panic_rolls_back_then_resumes() {
        let (tm, backend) = manager();
        let tm2 = tm.clone();

        let handle = tokio::spawn(async move {
            tm2.run(|| async {
                if true {
                    panic!("boom");
                }
                Ok(())
            })
            .await
        });

        let join = handle.await.unwrap_err();
        assert!(join.is_panic());
        assert_eq!(
            backend.journal(),
            vec![TxOp::Begin(TxOptions::default()), TxOp::Rollback]
        );
    }

    struct FailingBackend {
        fail_commit: bool,
        fail_rollback: bool,
    }

    struct FailingTransaction {
        fail_commit: bool,
        fail_rollback: bool,
        finished: AtomicBool,
    }

    #[async_trait]
    impl TxBackend for FailingBackend {
        async fn begin(&self, _options: TxOptions) -> Result<Arc<dyn Transaction>> {
            Ok(Arc::new(FailingTransaction {
                fail_commit: self.fail_commit,
                fail_rollback: self.fail_rollback,
                finished: AtomicBool::new(false),
            }))
        }
    }

    #[async_trait]
    impl Transaction for FailingTransaction {
        async fn savepoint(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn rollback_to_savepoint(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn release_savepoint(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn commit(&self) -> Result<()> {
            self.finished.store(true, Ordering::SeqCst);
            if self.fail_commit {
                return Err(Error::Unexpected("commit failed".into()));
            }
            Ok(())
        }

        async fn rollback(&self) -> Result<()> {
            self.finished.store(true, Ordering::SeqCst);
            if self.fail_rollback {
                return Err(Error::Unexpected("rollback failed".into()));
            }
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[tokio::test]
    async fn commit_failure_is_returned() {
        let tm = TransactionManager::new(Arc::new(FailingBackend {
            fail_commit: true,
            fail_rollback: false,
        }));

        let err = tm.run(|| async { Ok(()) }).await.unwrap_err();
        assert_eq!(err.to_string(), "unexpected error: commit failed");
    }

    #[tokio::test]
    async fn rollback_failure_is_combined_with_original() {
        let tm = TransactionManager::new(Arc::new(FailingBackend {
            fail_commit: false,
            fail_rollback: true,
        }));

        let err = tm
            .run(|| async { Err::<(), _>(Error::RideCannotBeCancelled) })
            .await
            .unwrap_err();

        match err {
            Error::Transaction { source, rollback } => {
                assert!(matches!(*source, Error::RideCannotBeCancelled));
                assert_eq!(rollback.to_string(), "unexpected error: rollback failed");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}

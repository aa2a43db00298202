//! Scenario-test fixtures for the balance engine: a disposable Postgres
//! schema, in-memory log/cache test doubles, and request builders. Nothing
//! here is wired into `bal-daemon` or `bal-cli` — it exists to let
//! integration tests exercise the real `bal-db`/`bal-consumer`/`bal-lease`
//! code paths without a live Kafka or Redis cluster.

pub mod db;
pub mod fakes;
pub mod requests;

pub use db::{connect_test_pool, truncate_all, ENV_TEST_DB_URL};
pub use fakes::{InMemoryLogConsumer, InMemoryLogProducer, RecordingSnapshotSink};

#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;
use std::time::Duration;

use queue_core::{Clock, JobId};

use db::{DbError, KeyFamily};

#[tokio::test]
async fn counters_sum_their_deltas() -> Result<(), Box<dyn Error>> {
    let (storage, _clock) = common::setup_storage().await?;
    let kv = storage.key_values();

    assert_eq!(kv.counter_value("stats:failed").await?, 0);
    kv.increment_counter("stats:failed", 1, None).await?;
    kv.increment_counter("stats:failed", 4, None).await?;
    kv.increment_counter("stats:failed", -2, None).await?;
    kv.increment_counter("stats:other", 10, None).await?;

    assert_eq!(kv.counter_value("stats:failed").await?, 3);

    let blank = kv.increment_counter(" ", 1, None).await;
    assert!(matches!(blank, Err(DbError::InvalidArgument(_))));
    Ok(())
}

#[tokio::test]
async fn sets_are_unique_and_ordered_by_score() -> Result<(), Box<dyn Error>> {
    let (storage, _clock) = common::setup_storage().await?;
    let kv = storage.key_values();

    kv.add_to_set("schedule", "later", 20.0).await?;
    kv.add_to_set("schedule", "sooner", 10.0).await?;
    kv.add_to_set("schedule", "later", 30.0).await?;
    kv.add_to_set("schedule", "dropped", 5.0).await?;
    kv.remove_from_set("schedule", "dropped").await?;

    assert_eq!(kv.set_members("schedule").await?, vec!["sooner", "later"]);
    Ok(())
}

#[tokio::test]
async fn hash_fields_are_upserted() -> Result<(), Box<dyn Error>> {
    let (storage, _clock) = common::setup_storage().await?;
    let kv = storage.key_values();

    kv.set_hash_fields("recurring-job:nightly", &[("Cron", "0 0 * * *"), ("Queue", "default")])
        .await?;
    kv.set_hash_fields("recurring-job:nightly", &[("Queue", "critical")])
        .await?;

    let fields = kv.hash_fields("recurring-job:nightly").await?;
    assert_eq!(fields.len(), 2);
    assert_eq!(fields.get("Cron").map(String::as_str), Some("0 0 * * *"));
    assert_eq!(fields.get("Queue").map(String::as_str), Some("critical"));
    Ok(())
}

#[tokio::test]
async fn list_ranges_start_from_the_newest_item() -> Result<(), Box<dyn Error>> {
    let (storage, _clock) = common::setup_storage().await?;
    let kv = storage.key_values();

    for item in ["one", "two", "three", "four"] {
        kv.insert_to_list("succeeded", item).await?;
    }

    assert_eq!(kv.list_range("succeeded", 0, 1).await?, vec!["four", "three"]);
    assert_eq!(kv.list_range("succeeded", 2, 10).await?, vec!["two", "one"]);
    assert!(kv.list_range("succeeded", 3, 2).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn ttl_follows_expire_and_persist() -> Result<(), Box<dyn Error>> {
    let (storage, clock) = common::setup_storage().await?;
    let kv = storage.key_values();

    kv.set_hash_fields("job-stats", &[("count", "1")]).await?;
    assert_eq!(kv.ttl(KeyFamily::Hash, "job-stats").await?, None);

    kv.expire(KeyFamily::Hash, "job-stats", Duration::from_secs(60)).await?;
    clock.advance(Duration::from_secs(15));
    assert_eq!(
        kv.ttl(KeyFamily::Hash, "job-stats").await?,
        Some(Duration::from_secs(45))
    );

    clock.advance(Duration::from_secs(120));
    assert_eq!(kv.ttl(KeyFamily::Hash, "job-stats").await?, Some(Duration::ZERO));

    kv.persist(KeyFamily::Hash, "job-stats").await?;
    assert_eq!(kv.ttl(KeyFamily::Hash, "job-stats").await?, None);
    Ok(())
}

#[tokio::test]
async fn job_records_keep_parameters_and_state() -> Result<(), Box<dyn Error>> {
    let (storage, clock) = common::setup_storage().await?;
    let jobs = storage.jobs();

    let id = jobs
        .create_expired_job(
            r#"{"type":"Mailer","method":"Send"}"#,
            &[("CurrentCulture", "en-GB")],
            clock.now(),
            Duration::from_secs(3600),
        )
        .await?;

    let job = jobs.get_job(&id).await?.ok_or("job missing")?;
    assert_eq!(job.invocation, r#"{"type":"Mailer","method":"Send"}"#);
    assert_eq!(job.created_at, clock.now());
    assert_eq!(
        job.expire_at,
        Some(clock.now() + chrono::Duration::seconds(3600))
    );
    assert_eq!(job.state_name, None);

    jobs.set_parameter(&id, "RetryCount", Some("2")).await?;
    jobs.set_parameter(&id, "RetryCount", Some("3")).await?;
    assert_eq!(jobs.get_parameter(&id, "RetryCount").await?.as_deref(), Some("3"));
    assert_eq!(jobs.get_parameter(&id, "CurrentCulture").await?.as_deref(), Some("en-GB"));
    assert_eq!(jobs.get_parameter(&id, "Missing").await?, None);

    jobs.set_state(&id, "Enqueued", Some("Triggered by test")).await?;
    jobs.persist_job(&id).await?;
    let job = jobs.get_job(&id).await?.ok_or("job missing")?;
    assert_eq!(job.state_name.as_deref(), Some("Enqueued"));
    assert_eq!(job.expire_at, None);
    Ok(())
}

#[tokio::test]
async fn failed_job_creation_leaves_nothing_behind() -> Result<(), Box<dyn Error>> {
    let (storage, clock) = common::setup_storage().await?;

    let result = storage
        .jobs()
        .create_expired_job(
            "{}",
            &[("RetryCount", "1"), ("RetryCount", "2")],
            clock.now(),
            Duration::from_secs(3600),
        )
        .await;
    assert!(result.is_err());

    let stored = storage
        .gate()
        .with_connection(false, |db| async move {
            let mut response = db
                .query(
                    "SELECT count() AS count FROM job GROUP ALL; SELECT count() AS count FROM job_parameter GROUP ALL;",
                )
                .await?;
            let jobs: Option<i64> = response.take((0, "count"))?;
            let parameters: Option<i64> = response.take((1, "count"))?;
            Ok((jobs.unwrap_or(0), parameters.unwrap_or(0)))
        })
        .await?;
    assert_eq!(stored, (0, 0));
    Ok(())
}

#[tokio::test]
async fn state_of_an_unknown_job_is_not_found() -> Result<(), Box<dyn Error>> {
    let (storage, _clock) = common::setup_storage().await?;

    let result = storage
        .jobs()
        .set_state(&JobId::from("does-not-exist"), "Processing", None)
        .await;
    assert!(matches!(result, Err(DbError::NotFound(_))));
    Ok(())
}

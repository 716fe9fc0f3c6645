//! Stream consumer: group membership, delivery, ack, reclaim.
//!
//! Reads event batches from the ingestion stream with `XREADGROUP`, hands
//! each entry to the pipeline on its own task, and acks only when the
//! error router says so — a released entry stays pending and re-delivers.
//! Entries left pending by dead consumers for longer than the idle window
//! are pulled back with `XAUTOCLAIM`.
//!
//! Backpressure is a semaphore sized to `MAX_PARALLEL_JOBS`: the read loop
//! never requests more entries than it holds permits for, so the pending
//! count per consumer stays bounded.
//!
//! Shutdown is cooperative: the loop stops reading, in-flight tasks get
//! the grace period to finish, and anything still running is aborted at
//! its next suspension point — un-acked, so the broker re-delivers it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context as _, Result};
use redis::streams::{StreamAutoClaimOptions, StreamAutoClaimReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::context::AppContext;
use crate::metrics;
use crate::pipeline;

/// How often the reclaim pass runs.
const RECLAIM_INTERVAL_SECS: u64 = 60;

/// Run the consumer until `shutdown` flips. Blocks for the lifetime of
/// the worker.
pub async fn run(ctx: Arc<AppContext>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let consumer_name = ctx.config.consumer_name();
    let stream = ctx.config.redis.stream_name.clone();
    let group = ctx.config.redis.consumer_group.clone();

    let mut conn = ctx.redis.clone();
    ensure_group(&mut conn, &stream, &group).await?;

    info!(
        consumer = %consumer_name,
        stream = %stream,
        group = %group,
        "consumer starting"
    );

    let slots = Arc::new(Semaphore::new(ctx.config.processing.max_parallel_jobs));
    let mut last_reclaim = Instant::now();

    while !*shutdown.borrow() {
        // Backpressure: only ask the broker for as many entries as we can
        // process right now.
        let available = slots.available_permits();
        if available == 0 {
            tokio::select! {
                permit = slots.clone().acquire_owned() => drop(permit),
                _ = shutdown.changed() => break,
            }
            continue;
        }
        let count = available.min(ctx.config.redis.batch_size);

        // Periodically steal entries stuck with dead consumers.
        if last_reclaim.elapsed().as_secs() >= RECLAIM_INTERVAL_SECS {
            last_reclaim = Instant::now();
            match reclaim_pending(&ctx, &mut conn, &stream, &group, &consumer_name, count).await {
                Ok(reclaimed) => {
                    for (entry_id, fields) in reclaimed {
                        spawn_entry(&ctx, &slots, &stream, &group, entry_id, fields, &shutdown)
                            .await;
                    }
                }
                Err(e) => warn!("pending-entry reclaim failed: {e}"),
            }
            continue;
        }

        let opts = StreamReadOptions::default()
            .group(&group, &consumer_name)
            .count(count)
            .block(ctx.config.redis.block_ms as usize);

        let stream_keys = [stream.as_str()];
        let reply: StreamReadReply = tokio::select! {
            read = conn.xread_options(&stream_keys, &[">"], &opts) => match read {
                Ok(reply) => reply,
                Err(e) => {
                    error!("stream read failed: {e}");
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    continue;
                }
            },
            _ = shutdown.changed() => break,
        };

        for stream_key in reply.keys {
            for entry in stream_key.ids {
                let fields = decode_fields(&entry.map);
                spawn_entry(&ctx, &slots, &stream, &group, entry.id, fields, &shutdown).await;
            }
        }
    }

    // Drain: give in-flight events the grace period, then let the broker
    // re-deliver whatever is left.
    info!("consumer draining in-flight events");
    let all = ctx.config.processing.max_parallel_jobs as u32;
    let drained =
        tokio::time::timeout(ctx.config.processing.shutdown_grace, slots.acquire_many(all)).await;
    match drained {
        Ok(_) => info!("consumer drained cleanly"),
        Err(_) => warn!("drain grace period expired with events still in flight"),
    }
    Ok(())
}

/// Spawn one entry's processing task, holding a backpressure permit for
/// its lifetime.
async fn spawn_entry(
    ctx: &Arc<AppContext>,
    slots: &Arc<Semaphore>,
    stream: &str,
    group: &str,
    entry_id: String,
    fields: HashMap<String, String>,
    shutdown: &watch::Receiver<bool>,
) {
    let permit = match slots.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };

    let ctx = Arc::clone(ctx);
    let stream = stream.to_string();
    let group = group.to_string();
    let mut shutdown = shutdown.clone();

    tokio::spawn(async move {
        let _permit = permit;
        let received_at = Instant::now();
        metrics::record_message_received();
        metrics::inflight_delta(1);

        let result = tokio::select! {
            result = pipeline::process_event(&ctx, &fields, received_at) => Some(result),
            _ = shutdown.changed() => None,
        };

        let mut conn = ctx.redis.clone();
        match result {
            None => {
                // Cancellation: the dropped future cleaned its temp files;
                // the entry stays un-acked for re-delivery.
                debug!(entry_id = %entry_id, "processing cancelled by shutdown");
            }
            Some(result) => {
                let should_ack = match result.outcome {
                    Ok(()) => true,
                    Err(err) => {
                        let raw: Vec<(String, String)> =
                            fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                        let disposition = ctx
                            .router
                            .handle(
                                &mut conn,
                                &ctx.store,
                                result.event.as_ref(),
                                &raw,
                                result.job_id,
                                result.attempt,
                                err,
                            )
                            .await;
                        disposition.should_ack()
                    }
                };

                if should_ack {
                    match conn.xack::<_, _, _, i64>(&stream, &group, &[entry_id.as_str()]).await {
                        Ok(_) => {
                            metrics::record_ack_latency(received_at.elapsed().as_secs_f64())
                        }
                        Err(e) => error!(entry_id = %entry_id, "ack failed: {e}"),
                    }
                }
            }
        }

        metrics::inflight_delta(-1);
    });
}

/// Create the consumer group, tolerating a concurrent creation.
async fn ensure_group(
    conn: &mut redis::aio::ConnectionManager,
    stream: &str,
    group: &str,
) -> Result<()> {
    let created: redis::RedisResult<String> = redis::cmd("XGROUP")
        .arg("CREATE")
        .arg(stream)
        .arg(group)
        .arg("0")
        .arg("MKSTREAM")
        .query_async(conn)
        .await;

    match created {
        Ok(_) => {
            info!(stream = %stream, group = %group, "created consumer group");
            Ok(())
        }
        Err(e) if e.to_string().contains("BUSYGROUP") => {
            debug!(group = %group, "consumer group already exists");
            Ok(())
        }
        Err(e) => Err(e).context("creating consumer group"),
    }
}

/// Claim entries pending longer than the idle window.
async fn reclaim_pending(
    ctx: &AppContext,
    conn: &mut redis::aio::ConnectionManager,
    stream: &str,
    group: &str,
    consumer_name: &str,
    count: usize,
) -> Result<Vec<(String, HashMap<String, String>)>> {
    let opts = StreamAutoClaimOptions::default().count(count);
    let reply: StreamAutoClaimReply = conn
        .xautoclaim_options(
            stream,
            group,
            consumer_name,
            ctx.config.redis.claim_idle.as_millis() as usize,
            "0-0",
            opts,
        )
        .await
        .context("XAUTOCLAIM failed")?;

    let claimed: Vec<(String, HashMap<String, String>)> = reply
        .claimed
        .into_iter()
        .map(|entry| (entry.id, decode_fields(&entry.map)))
        .collect();

    if !claimed.is_empty() {
        info!(count = claimed.len(), "reclaimed idle pending entries");
    }
    Ok(claimed)
}

/// Flatten a stream entry's value map into strings; non-string values are
/// skipped (the parser reports them as missing fields).
fn decode_fields(map: &HashMap<String, redis::Value>) -> HashMap<String, String> {
    map.iter()
        .filter_map(|(key, value)| {
            redis::from_redis_value::<String>(value)
                .ok()
                .map(|v| (key.clone(), v))
        })
        .collect()
}

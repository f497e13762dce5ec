//! `simulate` subcommand.
//!
//! Wires the whole sync core to one in-memory store and plays a shift:
//! machine terminals open downtimes, the dashboard closes them and logs
//! production, a range report is served through the query cache and the
//! status board follows the live mirror. Statistics from every component
//! are printed as JSON at the end.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hokkaido_sync::{
    Collection, Document, EventBus, Fields, InvalidationRouter, LiveMirror, MemoryStore,
    QueryCache, QueryFilters, RemoteStore, Repository, StateStore, SyncConfig, Visibility,
};
use miette::{IntoDiagnostic, Result};
use serde_json::{Value, json};
use tracing::{debug, info};

const REASONS: [&str; 4] = ["tool change", "material shortage", "setup", "quality hold"];

/// Replay the status board's last snapshot every this many ticks, as a
/// client does after a reconnect.
const REPLAY_EVERY: u32 = 8;

/// Shape of the simulated shift.
#[derive(Debug, Clone, Copy)]
pub struct Shift {
    pub machines: u8,
    pub ticks: u32,
    pub tick: Duration,
}

fn fields(value: Value) -> Fields {
    value.as_object().cloned().unwrap_or_default()
}

pub async fn run(config: SyncConfig, shift: Shift) -> Result<()> {
    let stats = simulate(config, shift).await?;
    let rendered = serde_json::to_string_pretty(&stats).into_diagnostic()?;
    println!("{rendered}");
    Ok(())
}

async fn simulate(config: SyncConfig, shift: Shift) -> Result<Value> {
    config.validate().into_diagnostic()?;
    if shift.machines == 0 {
        miette::bail!("at least one machine is required");
    }

    let machines: Vec<String> = (1..=shift.machines).map(|n| format!("H{n:02}")).collect();
    let today = Utc::now().format("%Y-%m-%d").to_string();

    let store = Arc::new(MemoryStore::with_max_batch_size(config.max_batch_size));
    let remote: Arc<dyn RemoteStore> = Arc::clone(&store) as Arc<dyn RemoteStore>;
    store.seed(
        Collection::Planning.as_str(),
        machines.iter().enumerate().map(|(i, machine)| {
            Document::new(
                format!("plan-{machine}"),
                fields(json!({"machine": machine, "order": format!("OP-{:04}", 1000 + i), "date": today})),
            )
        }),
    );

    // Composition point
    let bus = EventBus::new();
    let state = StateStore::new(bus.clone(), config.state_ttl());
    let query_cache = Arc::new(QueryCache::new(config.query_cache_ttl()));
    let router = InvalidationRouter::builder(bus.clone(), Arc::clone(&state))
        .query_cache(Arc::clone(&query_cache))
        .build();

    let mut repositories = BTreeMap::new();
    for collection in Collection::ALL {
        let repository = Repository::for_collection(
            collection,
            Arc::clone(&remote),
            Arc::clone(&state),
            bus.clone(),
            &config,
        );
        router.register_repository(collection, Arc::clone(&repository));
        repositories.insert(collection, repository);
    }
    let repository = |collection: Collection| Arc::clone(&repositories[&collection]);
    let production = repository(Collection::ProductionEntries);
    let downtime_log = repository(Collection::DowntimeEntries);
    let planning = repository(Collection::Planning);
    let system_logs = repository(Collection::SystemLogs);

    bus.on("production_entries:changed", |data| {
        debug!(machine = %data["extraKey"], "production board refreshed");
        Ok(())
    });

    let mirror = LiveMirror::from_config(Arc::clone(&remote), bus.clone(), &config);
    mirror.subscribe(|_, deltas| {
        for delta in deltas {
            info!(machine = %delta.doc_id, change = ?delta.kind, "machine status changed");
        }
        Ok(())
    });
    mirror.start().await;

    planning
        .subscribe("planning-board", None, |docs| {
            debug!(orders = docs.len(), "planning board refreshed");
            Ok(())
        })
        .await
        .into_diagnostic()?;

    info!(machines = machines.len(), ticks = shift.ticks, "shift started");
    let report_key = format!("prod_{today}_{today}");
    let report_filters = QueryFilters::new().where_eq("date", json!(today));

    for tick in 0..shift.ticks {
        let machine = &machines[tick as usize % machines.len()];
        let now = Utc::now().to_rfc3339();

        if let Some(open) = mirror.get_for_machine(machine) {
            // The dashboard operator closes the downtime
            router
                .invalidate_after_write(
                    Collection::ActiveDowntimes,
                    remote.delete(Collection::ActiveDowntimes.as_str(), &open.id),
                    Some(machine.as_str()),
                )
                .await
                .into_diagnostic()?;
            let reason = open.get("reason").cloned().unwrap_or(Value::Null);
            downtime_log
                .create(fields(json!({
                    "machine": machine,
                    "reason": reason,
                    "endedAt": now,
                    "date": today,
                })))
                .await
                .into_diagnostic()?;
        } else {
            // The machine terminal opens one; the dashboard only observes it
            store.seed(
                Collection::ActiveDowntimes.as_str(),
                [Document::new(
                    machine.clone(),
                    fields(json!({
                        "machine": machine,
                        "reason": REASONS[tick as usize % REASONS.len()],
                        "startedAt": now,
                    })),
                )],
            );
        }

        router
            .invalidate_after_write(
                Collection::ProductionEntries,
                production.create(fields(json!({
                    "machine": machine,
                    "quantity": 10 + tick % 7,
                    "date": today,
                }))),
                Some(machine.as_str()),
            )
            .await
            .into_diagnostic()?;

        let report = query_cache
            .get_or_fetch(&report_key, || {
                remote.query(Collection::ProductionEntries.as_str(), &report_filters)
            })
            .await
            .into_diagnostic()?;
        let board = production
            .get_all(&QueryFilters::new(), false)
            .await
            .into_diagnostic()?;
        debug!(report = report.len(), board = board.len(), "dashboard read");

        system_logs
            .create(fields(json!({"action": "tick", "tick": tick, "at": now})))
            .await
            .into_diagnostic()?;

        if tick % REPLAY_EVERY == REPLAY_EVERY / 2 {
            store.replay_to_listeners(Collection::ActiveDowntimes.as_str());
            mirror.set_visibility(Visibility::Hidden).await;
            tokio::time::sleep(shift.tick).await;
            mirror.set_visibility(Visibility::Visible).await;
        }

        tokio::time::sleep(shift.tick).await;
    }

    // End of shift: purge the tick log in committed batches
    let log_ids: Vec<String> = system_logs
        .get_all(&QueryFilters::new(), true)
        .await
        .into_diagnostic()?
        .into_iter()
        .map(|doc| doc.id)
        .collect();
    let purged = system_logs.delete_many(&log_ids).await.into_diagnostic()?;
    info!(purged, "system log purged");

    tokio::time::sleep(shift.tick).await;
    planning.unsubscribe_all();

    let repository_stats: BTreeMap<&str, _> = repositories
        .iter()
        .map(|(collection, repository)| (collection.as_str(), repository.read_stats()))
        .collect();
    let stats = json!({
        "mirror": mirror.stats(),
        "state": state.stats(),
        "queryCache": query_cache.stats(),
        "router": router.stats(),
        "events": bus.stats(),
        "repositories": repository_stats,
        "store": {
            "reads": store.read_count(),
            "writes": store.write_count(),
            "batchCommits": store.batch_commit_count(),
        },
    });
    mirror.stop();
    info!("shift finished");
    Ok(stats)
}

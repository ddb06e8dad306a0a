//! Triggers, execution intents, and the intent dispatcher.
//!
//! Triggers never run workflows directly. A record event, schedule fire, or
//! manual call emits a durable *intent*; the dispatcher consumes pending
//! intents and asks the workflow engine for an execution. The intent row is
//! what makes the chain idempotent: a second intent with the same
//! `(tenant_id, idempotency_key)` is recorded as `duplicate` and never
//! produces a second execution.
//!
//! The schedule poller is a single control-plane task with a configurable
//! tick. It keeps its per-trigger `last_check` map in memory; nothing else
//! mutates it. The dispatcher runs a bounded worker pool of W threads,
//! draining intents FIFO within a tenant and round-robin across tenants.

use crate::core::broker::DbBroker;
use crate::core::context::{Capability, CapabilityProfile, OpContext};
use crate::core::db;
use crate::core::error::ChangeOpsError;
use crate::core::store::{Store, StoreConfig};
use crate::core::time;
use crate::plugins::workflow::WorkflowEngine;
use regex::Regex;
use rusqlite::{Connection, OptionalExtension, params};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, Mutex};
use std::thread;

pub const EVENT_RECORD_CREATED: &str = "record.created";
pub const EVENT_RECORD_UPDATED: &str = "record.updated";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Record,
    Schedule,
    Manual,
}

impl TriggerType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Record => "record",
            Self::Schedule => "schedule",
            Self::Manual => "manual",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ChangeOpsError> {
        match raw {
            "record" => Ok(Self::Record),
            "schedule" => Ok(Self::Schedule),
            "manual" => Ok(Self::Manual),
            other => Err(ChangeOpsError::InvariantViolation(format!(
                "unknown trigger type '{}'",
                other
            ))),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    Active,
    Disabled,
}

impl TriggerStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Disabled => "disabled",
        }
    }

    fn parse(raw: &str) -> Result<Self, ChangeOpsError> {
        match raw {
            "active" => Ok(Self::Active),
            "disabled" => Ok(Self::Disabled),
            other => Err(ChangeOpsError::InvariantViolation(format!(
                "unknown trigger status '{}'",
                other
            ))),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FieldCondition {
    pub field: String,
    pub equals: JsonValue,
}

/// Trigger configuration, decoded into the variant for its type at the
/// boundary.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    Record {
        record_type: String,
        /// `record.created` or `record.updated`.
        event: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        field_conditions: Vec<FieldCondition>,
    },
    Schedule {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cron: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interval_secs: Option<u64>,
    },
    Manual {},
}

impl TriggerConfig {
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            Self::Record { .. } => TriggerType::Record,
            Self::Schedule { .. } => TriggerType::Schedule,
            Self::Manual {} => TriggerType::Manual,
        }
    }

    fn validate(&self) -> Result<(), ChangeOpsError> {
        match self {
            Self::Record { event, .. } => {
                if event != EVENT_RECORD_CREATED && event != EVENT_RECORD_UPDATED {
                    return Err(ChangeOpsError::validation(
                        "UNKNOWN_RECORD_EVENT",
                        format!("'{}' is not a record event", event),
                    ));
                }
                Ok(())
            }
            Self::Schedule { cron, interval_secs } => match (cron, interval_secs) {
                (Some(_), Some(_)) | (None, None) => Err(ChangeOpsError::validation(
                    "SCHEDULE_CONFIG_AMBIGUOUS",
                    "schedule triggers take exactly one of cron or interval_secs",
                )),
                (Some(expr), None) => {
                    CronSpec::parse(expr)?;
                    Ok(())
                }
                (None, Some(interval)) => {
                    if *interval == 0 {
                        return Err(ChangeOpsError::validation(
                            "SCHEDULE_INTERVAL_ZERO",
                            "interval must be positive",
                        ));
                    }
                    Ok(())
                }
            },
            Self::Manual {} => Ok(()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowTrigger {
    pub id: String,
    pub tenant_id: String,
    pub workflow_definition_id: String,
    pub trigger_type: TriggerType,
    pub config: TriggerConfig,
    pub status: TriggerStatus,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Pending,
    Dispatched,
    Failed,
    Duplicate,
}

impl IntentStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::Failed => "failed",
            Self::Duplicate => "duplicate",
        }
    }

    fn parse(raw: &str) -> Result<Self, ChangeOpsError> {
        match raw {
            "pending" => Ok(Self::Pending),
            "dispatched" => Ok(Self::Dispatched),
            "failed" => Ok(Self::Failed),
            "duplicate" => Ok(Self::Duplicate),
            other => Err(ChangeOpsError::InvariantViolation(format!(
                "unknown intent status '{}'",
                other
            ))),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExecutionIntent {
    pub id: String,
    pub tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<String>,
    pub workflow_definition_id: String,
    pub trigger_type: TriggerType,
    pub trigger_payload: JsonValue,
    pub idempotency_key: String,
    pub status: IntentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// Inbound record event as delivered to the ingress endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordEvent {
    pub record_type: String,
    pub event: String,
    /// Caller-supplied identity for the event; the idempotency anchor.
    pub event_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<JsonValue>,
    pub after: JsonValue,
}

fn idempotency_key(trigger_id: &str, event_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(trigger_id.as_bytes());
    hasher.update(b":");
    hasher.update(event_id.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(32);
    for b in digest.iter().take(16) {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

// --- Cron subset ---

/// Minute-resolution cron subset: `*/n * * * *` step forms and fixed
/// `m h * * *` forms. Anything richer is rejected at trigger creation.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CronSpec {
    EveryNMinutes(u64),
    DailyAt { minute: u64, hour: u64 },
}

impl CronSpec {
    fn parse(expr: &str) -> Result<Self, ChangeOpsError> {
        let step_re = Regex::new(r"^\*/(\d{1,3}) \* \* \* \*$").unwrap();
        let fixed_re = Regex::new(r"^(\d{1,2}) (\d{1,2}) \* \* \*$").unwrap();
        if let Some(caps) = step_re.captures(expr.trim()) {
            let n: u64 = caps[1].parse().unwrap_or(0);
            if n == 0 || n > 59 {
                return Err(ChangeOpsError::validation(
                    "CRON_UNSUPPORTED",
                    format!("step must be 1..=59, got '{}'", expr),
                ));
            }
            return Ok(Self::EveryNMinutes(n));
        }
        if let Some(caps) = fixed_re.captures(expr.trim()) {
            let minute: u64 = caps[1].parse().unwrap_or(60);
            let hour: u64 = caps[2].parse().unwrap_or(24);
            if minute > 59 || hour > 23 {
                return Err(ChangeOpsError::validation(
                    "CRON_UNSUPPORTED",
                    format!("minute/hour out of range in '{}'", expr),
                ));
            }
            return Ok(Self::DailyAt { minute, hour });
        }
        Err(ChangeOpsError::validation(
            "CRON_UNSUPPORTED",
            format!("unsupported cron expression '{}'", expr),
        ))
    }

    /// Latest fire time in `(last_check, now]`, as epoch seconds on a minute
    /// boundary.
    fn fire_within(&self, last_check: u64, now: u64) -> Option<u64> {
        if now <= last_check {
            return None;
        }
        let last_minute = last_check / 60;
        let now_minute = now / 60;
        // Bounded scan; the poller tick is far shorter than this.
        let start = last_minute.max(now_minute.saturating_sub(24 * 60));
        let mut hit = None;
        for minute in (start + 1)..=now_minute {
            let matches = match self {
                Self::EveryNMinutes(n) => minute % n == 0,
                Self::DailyAt { minute: m, hour } => {
                    minute % 60 == *m && (minute / 60) % 24 == *hour
                }
            };
            if matches {
                hit = Some(minute * 60);
            }
        }
        hit
    }
}

// --- Trigger hub ---

pub struct TriggerHub {
    store: Store,
    broker: DbBroker,
}

impl TriggerHub {
    pub fn new(store: &Store) -> Self {
        Self {
            store: store.clone(),
            broker: DbBroker::new(&store.root),
        }
    }

    fn db_path(&self) -> std::path::PathBuf {
        db::trigger_db_path(&self.store.root)
    }

    pub fn create_trigger(
        &self,
        ctx: &OpContext,
        workflow_definition_id: &str,
        config: TriggerConfig,
    ) -> Result<WorkflowTrigger, ChangeOpsError> {
        config.validate()?;
        let id = time::new_event_id();
        let def_id = workflow_definition_id.to_string();
        let trigger_type = config.trigger_type();
        let config_json = serde_json::to_string(&config)
            .map_err(|e| ChangeOpsError::InvariantViolation(format!("config encode: {}", e)))?;
        self.broker
            .with_conn(&self.db_path(), ctx, "trigger.create", |conn| {
                conn.execute(
                    "INSERT INTO workflow_triggers
                     (id, tenant_id, workflow_definition_id, trigger_type, trigger_config, status, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6)",
                    params![
                        id,
                        ctx.tenant_id(),
                        def_id,
                        trigger_type.as_str(),
                        config_json,
                        time::now_epoch_z()
                    ],
                )?;
                Ok(())
            })?;
        self.get_trigger(ctx, &id)
    }

    pub fn get_trigger(
        &self,
        ctx: &OpContext,
        trigger_id: &str,
    ) -> Result<WorkflowTrigger, ChangeOpsError> {
        let id = trigger_id.to_string();
        let trigger = self
            .broker
            .with_conn(&self.db_path(), ctx, "trigger.get", |conn| {
                read_trigger(conn, ctx.tenant_id(), &id)
            })?
            .ok_or_else(|| ChangeOpsError::NotFound(format!("trigger '{}' not found", id)))?;
        ctx.ensure_tenant(&trigger.tenant_id)?;
        Ok(trigger)
    }

    pub fn list_triggers(
        &self,
        ctx: &OpContext,
        trigger_type: Option<TriggerType>,
    ) -> Result<Vec<WorkflowTrigger>, ChangeOpsError> {
        self.broker
            .with_conn(&self.db_path(), ctx, "trigger.list", |conn| {
                let mut sql =
                    String::from("SELECT id FROM workflow_triggers WHERE tenant_id = ?1");
                if trigger_type.is_some() {
                    sql.push_str(" AND trigger_type = ?2");
                }
                sql.push_str(" ORDER BY created_at, id");
                let mut stmt = conn.prepare(&sql)?;
                let ids: Vec<String> = match trigger_type {
                    Some(t) => stmt
                        .query_map(params![ctx.tenant_id(), t.as_str()], |row| row.get(0))?
                        .collect::<Result<_, _>>()?,
                    None => stmt
                        .query_map(params![ctx.tenant_id()], |row| row.get(0))?
                        .collect::<Result<_, _>>()?,
                };
                let mut triggers = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(trigger) = read_trigger(conn, ctx.tenant_id(), &id)? {
                        triggers.push(trigger);
                    }
                }
                Ok(triggers)
            })
    }

    pub fn set_trigger_status(
        &self,
        ctx: &OpContext,
        trigger_id: &str,
        status: TriggerStatus,
    ) -> Result<WorkflowTrigger, ChangeOpsError> {
        self.get_trigger(ctx, trigger_id)?;
        let id = trigger_id.to_string();
        self.broker
            .with_conn(&self.db_path(), ctx, "trigger.status", |conn| {
                conn.execute(
                    "UPDATE workflow_triggers SET status = ?1, updated_at = ?2
                     WHERE tenant_id = ?3 AND id = ?4",
                    params![status.as_str(), time::now_epoch_z(), ctx.tenant_id(), id],
                )?;
                Ok(())
            })?;
        self.get_trigger(ctx, trigger_id)
    }

    // --- Intent emission ---

    /// Match an inbound record event against the tenant's active record
    /// triggers and emit one intent per match.
    pub fn ingest_record_event(
        &self,
        ctx: &OpContext,
        event: &RecordEvent,
    ) -> Result<Vec<ExecutionIntent>, ChangeOpsError> {
        if event.event != EVENT_RECORD_CREATED && event.event != EVENT_RECORD_UPDATED {
            return Err(ChangeOpsError::validation(
                "UNKNOWN_RECORD_EVENT",
                format!("'{}' is not a record event", event.event),
            ));
        }
        let triggers = self.list_triggers(ctx, Some(TriggerType::Record))?;
        let mut intents = Vec::new();
        for trigger in triggers {
            if trigger.status != TriggerStatus::Active {
                continue;
            }
            let TriggerConfig::Record {
                record_type,
                event: trigger_event,
                field_conditions,
            } = &trigger.config
            else {
                continue;
            };
            if record_type != &event.record_type || trigger_event != &event.event {
                continue;
            }
            let matches = field_conditions.iter().all(|condition| {
                event.after.get(&condition.field) == Some(&condition.equals)
            });
            if !matches {
                continue;
            }
            let key = idempotency_key(&trigger.id, &event.event_id);
            let payload = serde_json::json!({
                "recordType": event.record_type,
                "event": event.event,
                "eventId": event.event_id,
                "after": event.after,
            });
            intents.push(self.emit_intent(
                ctx,
                Some(&trigger.id),
                &trigger.workflow_definition_id,
                TriggerType::Record,
                payload,
                &key,
            )?);
        }
        Ok(intents)
    }

    /// Manual firing. Disabled triggers reject.
    pub fn fire_manual(
        &self,
        ctx: &OpContext,
        trigger_id: &str,
        payload: JsonValue,
    ) -> Result<ExecutionIntent, ChangeOpsError> {
        let trigger = self.get_trigger(ctx, trigger_id)?;
        if trigger.status != TriggerStatus::Active {
            return Err(ChangeOpsError::StateInvalid(format!(
                "trigger '{}' is disabled",
                trigger_id
            )));
        }
        if trigger.trigger_type != TriggerType::Manual {
            return Err(ChangeOpsError::StateInvalid(format!(
                "trigger '{}' is not manual",
                trigger_id
            )));
        }
        let key = idempotency_key(trigger_id, &time::new_event_id());
        self.emit_intent(
            ctx,
            Some(trigger_id),
            &trigger.workflow_definition_id,
            TriggerType::Manual,
            payload,
            &key,
        )
    }

    /// Durable intent insert. A pre-existing `(tenant, idempotency_key)` row
    /// turns this insert into a `duplicate` marker that will never execute.
    pub fn emit_intent(
        &self,
        ctx: &OpContext,
        trigger_id: Option<&str>,
        workflow_definition_id: &str,
        trigger_type: TriggerType,
        payload: JsonValue,
        key: &str,
    ) -> Result<ExecutionIntent, ChangeOpsError> {
        let id = time::new_event_id();
        let trigger = trigger_id.map(|s| s.to_string());
        let def_id = workflow_definition_id.to_string();
        let key = key.to_string();
        let payload_json = payload.to_string();
        self.broker
            .with_conn(&self.db_path(), ctx, "intent.emit", |conn| {
                let existing: Option<String> = conn
                    .query_row(
                        "SELECT id FROM execution_intents
                         WHERE tenant_id = ?1 AND idempotency_key = ?2 AND status != 'duplicate'",
                        params![ctx.tenant_id(), key],
                        |row| row.get(0),
                    )
                    .optional()?;
                let status = if existing.is_some() {
                    IntentStatus::Duplicate
                } else {
                    IntentStatus::Pending
                };
                conn.execute(
                    "INSERT INTO execution_intents
                     (id, tenant_id, trigger_id, workflow_definition_id, trigger_type,
                      trigger_payload, idempotency_key, status, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        id,
                        ctx.tenant_id(),
                        trigger,
                        def_id,
                        trigger_type.as_str(),
                        payload_json,
                        key,
                        status.as_str(),
                        time::now_epoch_z()
                    ],
                )?;
                Ok(())
            })?;
        self.get_intent(ctx, &id)
    }

    pub fn get_intent(&self, ctx: &OpContext, intent_id: &str) -> Result<ExecutionIntent, ChangeOpsError> {
        let id = intent_id.to_string();
        let intent = self
            .broker
            .with_conn(&self.db_path(), ctx, "intent.get", |conn| {
                read_intent(conn, ctx.tenant_id(), &id)
            })?
            .ok_or_else(|| ChangeOpsError::NotFound(format!("intent '{}' not found", id)))?;
        ctx.ensure_tenant(&intent.tenant_id)?;
        Ok(intent)
    }

    pub fn list_intents(
        &self,
        ctx: &OpContext,
        status: Option<IntentStatus>,
    ) -> Result<Vec<ExecutionIntent>, ChangeOpsError> {
        self.broker
            .with_conn(&self.db_path(), ctx, "intent.list", |conn| {
                let mut sql =
                    String::from("SELECT id FROM execution_intents WHERE tenant_id = ?1");
                if status.is_some() {
                    sql.push_str(" AND status = ?2");
                }
                sql.push_str(" ORDER BY created_at, id");
                let mut stmt = conn.prepare(&sql)?;
                let ids: Vec<String> = match status {
                    Some(s) => stmt
                        .query_map(params![ctx.tenant_id(), s.as_str()], |row| row.get(0))?
                        .collect::<Result<_, _>>()?,
                    None => stmt
                        .query_map(params![ctx.tenant_id()], |row| row.get(0))?
                        .collect::<Result<_, _>>()?,
                };
                let mut intents = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(intent) = read_intent(conn, ctx.tenant_id(), &id)? {
                        intents.push(intent);
                    }
                }
                Ok(intents)
            })
    }
}

// --- Schedule poller ---

/// Single control-plane poll loop. `last_check` lives here and nowhere else.
pub struct SchedulePoller {
    hub: TriggerHub,
    last_check: FxHashMap<String, u64>,
    tick_secs: u64,
}

impl SchedulePoller {
    pub fn new(store: &Store, config: &StoreConfig) -> Self {
        Self {
            hub: TriggerHub::new(store),
            last_check: FxHashMap::default(),
            tick_secs: config.schedule_tick_secs,
        }
    }

    pub fn tick_secs(&self) -> u64 {
        self.tick_secs
    }

    /// One poll pass at `now`: emit an intent for every active schedule
    /// trigger whose next fire time falls within `(last_check, now]`.
    pub fn run_once(&mut self, now: u64) -> Result<Vec<ExecutionIntent>, ChangeOpsError> {
        let tenants = self.hub.tenant_ids_with_schedule_triggers()?;
        let mut fired = Vec::new();
        for tenant_id in tenants {
            let ctx = OpContext::system(&tenant_id);
            let triggers = self.hub.list_triggers(&ctx, Some(TriggerType::Schedule))?;
            for trigger in triggers {
                if trigger.status != TriggerStatus::Active {
                    continue;
                }
                let TriggerConfig::Schedule { cron, interval_secs } = &trigger.config else {
                    continue;
                };
                let last = *self
                    .last_check
                    .entry(trigger.id.clone())
                    .or_insert_with(|| now.saturating_sub(self.tick_secs));
                let fired_at = match (cron, interval_secs) {
                    (Some(expr), None) => CronSpec::parse(expr)?.fire_within(last, now),
                    (None, Some(interval)) => {
                        if now > last && now - last >= *interval {
                            Some(now)
                        } else {
                            None
                        }
                    }
                    _ => None,
                };
                match fired_at {
                    Some(fired_at) => {
                        let key = idempotency_key(&trigger.id, &fired_at.to_string());
                        let payload = serde_json::json!({ "firedAt": fired_at });
                        fired.push(self.hub.emit_intent(
                            &ctx,
                            Some(&trigger.id),
                            &trigger.workflow_definition_id,
                            TriggerType::Schedule,
                            payload,
                            &key,
                        )?);
                        self.last_check.insert(trigger.id, fired_at.max(last));
                    }
                    None => {
                        // Cron tracks a half-open check window; interval
                        // tracks the last fire time and must not advance on
                        // a pass that did not fire.
                        if cron.is_some() {
                            self.last_check.insert(trigger.id, now.max(last));
                        }
                    }
                }
            }
        }
        Ok(fired)
    }

    /// Blocking poll loop for the CLI runner; exits when `stop` is raised.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<(), ChangeOpsError> {
        while !stop.load(Ordering::SeqCst) {
            self.run_once(time::now_epoch_secs())?;
            let tick = std::time::Duration::from_secs(self.tick_secs);
            let mut slept = std::time::Duration::ZERO;
            let step = std::time::Duration::from_millis(200);
            while slept < tick && !stop.load(Ordering::SeqCst) {
                thread::sleep(step);
                slept += step;
            }
        }
        Ok(())
    }
}

impl TriggerHub {
    fn tenant_ids_with_schedule_triggers(&self) -> Result<Vec<String>, ChangeOpsError> {
        self.broker
            .with_system_conn(&self.db_path(), "trigger.poll", |conn| {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT tenant_id FROM workflow_triggers
                     WHERE trigger_type = 'schedule' AND status = 'active' ORDER BY tenant_id",
                )?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
    }

    fn pending_by_tenant(&self) -> Result<Vec<(String, Vec<String>)>, ChangeOpsError> {
        self.broker
            .with_system_conn(&self.db_path(), "intent.scan", |conn| {
                let mut stmt = conn.prepare(
                    "SELECT tenant_id, id FROM execution_intents
                     WHERE status = 'pending' ORDER BY tenant_id, created_at, id",
                )?;
                let rows: Vec<(String, String)> = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<_, _>>()?;
                let mut grouped: Vec<(String, Vec<String>)> = Vec::new();
                for (tenant_id, intent_id) in rows {
                    match grouped.last_mut() {
                        Some((tenant, ids)) if *tenant == tenant_id => ids.push(intent_id),
                        _ => grouped.push((tenant_id, vec![intent_id])),
                    }
                }
                Ok(grouped)
            })
    }

    fn mark_intent(
        &self,
        ctx: &OpContext,
        intent_id: &str,
        status: IntentStatus,
        execution_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), ChangeOpsError> {
        let id = intent_id.to_string();
        let execution = execution_id.map(|s| s.to_string());
        let error = error.map(|s| s.to_string());
        self.broker
            .with_conn(&self.db_path(), ctx, "intent.mark", |conn| {
                conn.execute(
                    "UPDATE execution_intents SET status = ?1, execution_id = ?2, error = ?3,
                     updated_at = ?4 WHERE tenant_id = ?5 AND id = ?6",
                    params![
                        status.as_str(),
                        execution,
                        error,
                        time::now_epoch_z(),
                        ctx.tenant_id(),
                        id
                    ],
                )?;
                Ok(())
            })
    }
}

// --- Dispatcher ---

/// Bounded-concurrency intent dispatcher.
pub struct Dispatcher {
    store: Store,
    concurrency: usize,
    recovery_horizon_secs: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub dispatched: usize,
    pub failed: usize,
    pub recovered: usize,
}

impl Dispatcher {
    pub fn new(store: &Store, config: &StoreConfig) -> Self {
        Self {
            store: store.clone(),
            concurrency: config.dispatcher_concurrency.max(1),
            recovery_horizon_secs: config.intent_recovery_horizon_secs,
        }
    }

    /// Startup recovery: `dispatched` intents that never got an execution go
    /// back to `pending` once they are older than the horizon.
    pub fn recover(&self) -> Result<usize, ChangeOpsError> {
        let broker = DbBroker::new(&self.store.root);
        let horizon = self.recovery_horizon_secs;
        let db_path = db::trigger_db_path(&self.store.root);
        broker.with_system_conn(&db_path, "intent.recover", |conn| {
            let cutoff = format!("{}Z", time::now_epoch_secs().saturating_sub(horizon));
            let reset = conn.execute(
                "UPDATE execution_intents SET status = 'pending', updated_at = ?1
                 WHERE status = 'dispatched' AND execution_id IS NULL AND created_at <= ?2",
                params![time::now_epoch_z(), cutoff],
            )?;
            Ok(reset)
        })
    }

    /// Drain all pending intents through a worker pool of W threads,
    /// FIFO within each tenant and round-robin across tenants.
    pub fn dispatch_pending(&self) -> Result<DispatchReport, ChangeOpsError> {
        let hub = TriggerHub::new(&self.store);
        let grouped = hub.pending_by_tenant()?;
        if grouped.is_empty() {
            return Ok(DispatchReport::default());
        }

        // Round-robin interleave: one intent per tenant per round.
        let mut queues: Vec<(String, std::collections::VecDeque<String>)> = grouped
            .into_iter()
            .map(|(tenant, ids)| (tenant, ids.into()))
            .collect();
        let mut interleaved: Vec<(String, String)> = Vec::new();
        while queues.iter().any(|(_, q)| !q.is_empty()) {
            for (tenant, queue) in &mut queues {
                if let Some(intent_id) = queue.pop_front() {
                    interleaved.push((tenant.clone(), intent_id));
                }
            }
        }

        let (tx, rx) = sync_channel::<(String, String)>(self.concurrency);
        let rx = Arc::new(Mutex::new(rx));
        let report = Arc::new(Mutex::new(DispatchReport::default()));

        thread::scope(|scope| {
            for _ in 0..self.concurrency {
                let rx = Arc::clone(&rx);
                let report = Arc::clone(&report);
                let store = self.store.clone();
                scope.spawn(move || {
                    loop {
                        let next = {
                            let guard = match rx.lock() {
                                Ok(guard) => guard,
                                Err(_) => return,
                            };
                            guard.recv()
                        };
                        let Ok((tenant_id, intent_id)) = next else {
                            return;
                        };
                        let ok = dispatch_one(&store, &tenant_id, &intent_id).is_ok();
                        if let Ok(mut r) = report.lock() {
                            if ok {
                                r.dispatched += 1;
                            } else {
                                r.failed += 1;
                            }
                        }
                    }
                });
            }
            for pair in interleaved {
                if tx.send(pair).is_err() {
                    break;
                }
            }
            drop(tx);
        });

        let report = Arc::try_unwrap(report)
            .map_err(|_| ChangeOpsError::InvariantViolation("dispatch report still shared".into()))?
            .into_inner()
            .map_err(|_| ChangeOpsError::InvariantViolation("dispatch report poisoned".into()))?;
        Ok(report)
    }
}

/// Dispatch a single pending intent: resolve the module execution context,
/// start the execution, record the outcome on the intent row.
fn dispatch_one(store: &Store, tenant_id: &str, intent_id: &str) -> Result<(), ChangeOpsError> {
    let ctx = OpContext::system(tenant_id);
    let hub = TriggerHub::new(store);
    let intent = hub.get_intent(&ctx, intent_id)?;
    if intent.status != IntentStatus::Pending {
        return Ok(());
    }

    // Workflow executions run under the workflow module profile.
    CapabilityProfile::WorkflowModuleDefault.require(&[Capability::FsRead])?;

    let engine = WorkflowEngine::new(store);
    match engine.start_execution(
        &ctx,
        &intent.workflow_definition_id,
        &intent.id,
        intent.trigger_payload.clone(),
    ) {
        Ok(execution) => {
            hub.mark_intent(
                &ctx,
                intent_id,
                IntentStatus::Dispatched,
                Some(&execution.id),
                None,
            )?;
            Ok(())
        }
        Err(e) => {
            hub.mark_intent(
                &ctx,
                intent_id,
                IntentStatus::Failed,
                None,
                Some(&e.to_string()),
            )?;
            Err(e)
        }
    }
}

// --- Row plumbing ---

fn read_trigger(
    conn: &Connection,
    tenant_id: &str,
    id: &str,
) -> Result<Option<WorkflowTrigger>, ChangeOpsError> {
    let row = conn
        .query_row(
            "SELECT id, tenant_id, workflow_definition_id, trigger_type, trigger_config, status,
                    created_at, updated_at
             FROM workflow_triggers WHERE tenant_id = ?1 AND id = ?2",
            params![tenant_id, id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            },
        )
        .optional()?;
    let Some((id, tenant_id, workflow_definition_id, type_raw, config_json, status_raw, created_at, updated_at)) =
        row
    else {
        return Ok(None);
    };
    Ok(Some(WorkflowTrigger {
        id,
        tenant_id,
        workflow_definition_id,
        trigger_type: TriggerType::parse(&type_raw)?,
        config: serde_json::from_str(&config_json).map_err(|e| {
            ChangeOpsError::InvariantViolation(format!("corrupt trigger config: {}", e))
        })?,
        status: TriggerStatus::parse(&status_raw)?,
        created_at,
        updated_at,
    }))
}

fn read_intent(
    conn: &Connection,
    tenant_id: &str,
    id: &str,
) -> Result<Option<ExecutionIntent>, ChangeOpsError> {
    let row = conn
        .query_row(
            "SELECT id, tenant_id, trigger_id, workflow_definition_id, trigger_type,
                    trigger_payload, idempotency_key, status, execution_id, error, created_at, updated_at
             FROM execution_intents WHERE tenant_id = ?1 AND id = ?2",
            params![tenant_id, id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, String>(10)?,
                    row.get::<_, Option<String>>(11)?,
                ))
            },
        )
        .optional()?;
    let Some((id, tenant_id, trigger_id, workflow_definition_id, type_raw, payload_json, idempotency_key, status_raw, execution_id, error, created_at, updated_at)) =
        row
    else {
        return Ok(None);
    };
    Ok(Some(ExecutionIntent {
        id,
        tenant_id,
        trigger_id,
        workflow_definition_id,
        trigger_type: TriggerType::parse(&type_raw)?,
        trigger_payload: serde_json::from_str(&payload_json).map_err(|e| {
            ChangeOpsError::InvariantViolation(format!("corrupt intent payload: {}", e))
        })?,
        idempotency_key,
        status: IntentStatus::parse(&status_raw)?,
        execution_id,
        error,
        created_at,
        updated_at,
    }))
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "trigger",
        "version": "1.0.0",
        "description": "Record/schedule/manual triggers, durable intents, bounded dispatcher",
        "commands": [
            { "name": "create", "parameters": ["definition", "config"] },
            { "name": "enable", "parameters": ["id"] },
            { "name": "disable", "parameters": ["id"] },
            { "name": "fire", "parameters": ["id", "payload"] },
            { "name": "record-event", "parameters": ["record_type", "event", "event_id", "after"] },
            { "name": "dispatch", "parameters": [] },
            { "name": "poll", "parameters": [] }
        ],
        "storage": ["trigger.db"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_is_stable_per_trigger_and_event() {
        let a = idempotency_key("trig-1", "evt-1");
        let b = idempotency_key("trig-1", "evt-1");
        let c = idempotency_key("trig-1", "evt-2");
        let d = idempotency_key("trig-2", "evt-1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn cron_subset_parses_and_rejects() {
        assert_eq!(CronSpec::parse("*/5 * * * *").unwrap(), CronSpec::EveryNMinutes(5));
        assert_eq!(
            CronSpec::parse("30 2 * * *").unwrap(),
            CronSpec::DailyAt { minute: 30, hour: 2 }
        );
        assert!(CronSpec::parse("*/0 * * * *").is_err());
        assert!(CronSpec::parse("* * * * *").is_err());
        assert!(CronSpec::parse("15 99 * * *").is_err());
        assert!(CronSpec::parse("0 0 1 1 *").is_err());
    }

    #[test]
    fn cron_fire_window_is_half_open() {
        let spec = CronSpec::EveryNMinutes(5);
        // 10:00 in minutes = 600 → seconds 36000.
        let base = 600 * 60;
        // Window (10:00, 10:04] contains no multiple of 5.
        assert_eq!(spec.fire_within(base, base + 4 * 60), None);
        // Window (10:00, 10:05] contains 10:05.
        assert_eq!(spec.fire_within(base, base + 5 * 60), Some(base + 5 * 60));
        // Empty or inverted windows never fire.
        assert_eq!(spec.fire_within(base, base), None);

        let daily = CronSpec::DailyAt { minute: 30, hour: 2 };
        let midnight = 24 * 60 * 60 * 10; // some day boundary
        let fire = daily.fire_within(midnight, midnight + 3 * 60 * 60);
        assert_eq!(fire, Some(midnight + 2 * 60 * 60 + 30 * 60));
    }

    #[test]
    fn schedule_config_requires_exactly_one_source() {
        assert!(TriggerConfig::Schedule {
            cron: None,
            interval_secs: None
        }
        .validate()
        .is_err());
        assert!(TriggerConfig::Schedule {
            cron: Some("*/5 * * * *".to_string()),
            interval_secs: Some(60)
        }
        .validate()
        .is_err());
        assert!(TriggerConfig::Schedule {
            cron: None,
            interval_secs: Some(60)
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn record_config_rejects_unknown_event() {
        let config = TriggerConfig::Record {
            record_type: "ticket".to_string(),
            event: "record.deleted".to_string(),
            field_conditions: vec![],
        };
        assert!(config.validate().is_err());
    }
}

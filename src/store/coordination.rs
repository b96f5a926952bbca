//! Agent lifecycle, inter-agent messaging, path reservations, and decision
//! traces. Like the bead operations, every mutation goes through the event
//! log first.

use chrono::{Duration, Utc};
use rusqlite::{OptionalExtension, Row, params};
use serde_json::json;
use uuid::Uuid;

use super::{HiveStore, events, events::append_in_tx, parse_dt, parse_string_array};
use crate::error::{HiveError, Result};
use crate::model::{AgentInfo, DecisionTrace, DecisionType, Message, Reservation};

pub const DEFAULT_RESERVATION_TTL_SECS: i64 = 15 * 60;

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<AgentInfo> {
    Ok(AgentInfo {
        project_key: row.get(0)?,
        name: row.get(1)?,
        program: row.get(2)?,
        model: row.get(3)?,
        registered_at: parse_dt(&row.get::<_, String>(4)?),
        last_seen_at: parse_dt(&row.get::<_, String>(5)?),
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        project_key: row.get(1)?,
        sender: row.get(2)?,
        recipients: parse_string_array(row.get(3)?),
        subject: row.get(4)?,
        body: row.get(5)?,
        created_at: parse_dt(&row.get::<_, String>(6)?),
        read_by: parse_string_array(row.get(7)?),
    })
}

fn reservation_from_row(row: &Row<'_>) -> rusqlite::Result<Reservation> {
    Ok(Reservation {
        id: row.get(0)?,
        project_key: row.get(1)?,
        agent: row.get(2)?,
        file_glob: row.get(3)?,
        acquired_at: parse_dt(&row.get::<_, String>(4)?),
        expires_at: parse_dt(&row.get::<_, String>(5)?),
    })
}

/// Literal prefix of a glob, up to its first metacharacter.
fn glob_prefix(glob: &str) -> &str {
    let end = glob
        .find(|c| matches!(c, '*' | '?' | '['))
        .unwrap_or(glob.len());
    glob[..end].trim_end_matches('/')
}

/// Two globs conflict when the literal prefix of one contains the other.
/// Prefix containment over-approximates real overlap.
pub(crate) fn globs_overlap(a: &str, b: &str) -> bool {
    let (pa, pb) = (glob_prefix(a), glob_prefix(b));
    if pa.is_empty() || pb.is_empty() {
        return true;
    }
    let norm = |p: &str| format!("{p}/");
    norm(pa).starts_with(&norm(pb)) || norm(pb).starts_with(&norm(pa))
}

impl HiveStore {
    // -----------------------------------------------------------------------
    // Agent registry
    // -----------------------------------------------------------------------

    pub fn register_agent(
        &self,
        project_key: &str,
        name: &str,
        program: Option<&str>,
        model: Option<&str>,
    ) -> Result<AgentInfo> {
        self.append_event(
            events::AGENT_REGISTERED,
            project_key,
            json!({ "name": name, "program": program, "model": model }),
        )?;
        self.get_agent(project_key, name)?
            .ok_or_else(|| HiveError::NotFound {
                kind: "agent",
                id: name.to_string(),
            })
    }

    /// Heartbeat: refresh `last_seen_at`.
    pub fn touch_agent(&self, project_key: &str, name: &str) -> Result<()> {
        if self.get_agent(project_key, name)?.is_none() {
            return Err(HiveError::NotFound {
                kind: "agent",
                id: name.to_string(),
            });
        }
        self.append_event(events::AGENT_SEEN, project_key, json!({ "name": name }))?;
        Ok(())
    }

    pub fn remove_agent(&self, project_key: &str, name: &str) -> Result<()> {
        if self.get_agent(project_key, name)?.is_none() {
            return Err(HiveError::NotFound {
                kind: "agent",
                id: name.to_string(),
            });
        }
        self.append_event(events::AGENT_REMOVED, project_key, json!({ "name": name }))?;
        Ok(())
    }

    pub fn get_agent(&self, project_key: &str, name: &str) -> Result<Option<AgentInfo>> {
        self.database()
            .conn()
            .query_row(
                "SELECT project_key, name, program, model, registered_at, last_seen_at
                 FROM agents WHERE project_key = ?1 AND name = ?2",
                params![project_key, name],
                agent_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn list_agents(&self, project_key: &str) -> Result<Vec<AgentInfo>> {
        let mut stmt = self.database().conn().prepare(
            "SELECT project_key, name, program, model, registered_at, last_seen_at
             FROM agents WHERE project_key = ?1 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![project_key], agent_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Remove agents unseen for longer than `max_age_secs`, cascading their
    /// reservations. Returns the removed names.
    pub fn cleanup_stale_agents(
        &self,
        project_key: &str,
        max_age_secs: i64,
    ) -> Result<Vec<String>> {
        let cutoff = Utc::now() - Duration::seconds(max_age_secs);
        let stale: Vec<String> = {
            let mut stmt = self.database().conn().prepare(
                "SELECT name FROM agents
                 WHERE project_key = ?1 AND last_seen_at < ?2 ORDER BY name",
            )?;
            let rows = stmt.query_map(params![project_key, cutoff.to_rfc3339()], |row| {
                row.get(0)
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };
        for name in &stale {
            self.append_event(events::AGENT_REMOVED, project_key, json!({ "name": name }))?;
        }
        Ok(stale)
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    pub fn send_message(
        &self,
        project_key: &str,
        sender: &str,
        recipients: &[String],
        subject: Option<&str>,
        body: &str,
    ) -> Result<Message> {
        let tx = self.database().conn().unchecked_transaction()?;
        let message_id: i64 = tx.query_row(
            "SELECT COALESCE(MAX(id), 0) + 1 FROM messages",
            [],
            |row| row.get(0),
        )?;
        append_in_tx(
            &tx,
            events::MESSAGE_SENT,
            project_key,
            json!({
                "message_id": message_id,
                "sender": sender,
                "recipients": recipients,
                "subject": subject,
                "body": body,
            }),
        )?;
        tx.commit()?;
        self.get_message(project_key, message_id)?
            .ok_or_else(|| HiveError::NotFound {
                kind: "message",
                id: message_id.to_string(),
            })
    }

    pub fn get_message(&self, project_key: &str, message_id: i64) -> Result<Option<Message>> {
        self.database()
            .conn()
            .query_row(
                "SELECT id, project_key, sender, recipients, subject, body, created_at, read_by
                 FROM messages WHERE project_key = ?1 AND id = ?2",
                params![project_key, message_id],
                message_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Messages addressed to `recipient` (or all project messages when
    /// `None`), oldest first. `unread_only` filters out already-read ones.
    pub fn list_messages(
        &self,
        project_key: &str,
        recipient: Option<&str>,
        unread_only: bool,
    ) -> Result<Vec<Message>> {
        let mut stmt = self.database().conn().prepare(
            "SELECT id, project_key, sender, recipients, subject, body, created_at, read_by
             FROM messages WHERE project_key = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![project_key], message_from_row)?;
        let mut messages = Vec::new();
        for row in rows {
            let message = row?;
            if let Some(recipient) = recipient {
                if !message.recipients.iter().any(|r| r == recipient || r == "*") {
                    continue;
                }
                if unread_only && message.read_by.iter().any(|r| r == recipient) {
                    continue;
                }
            }
            messages.push(message);
        }
        Ok(messages)
    }

    pub fn mark_message_read(
        &self,
        project_key: &str,
        message_id: i64,
        agent: &str,
    ) -> Result<()> {
        if self.get_message(project_key, message_id)?.is_none() {
            return Err(HiveError::NotFound {
                kind: "message",
                id: message_id.to_string(),
            });
        }
        self.append_event(
            events::MESSAGE_READ,
            project_key,
            json!({ "message_id": message_id, "agent": agent }),
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reservations
    // -----------------------------------------------------------------------

    /// Lease a path pattern. Expired leases are pruned first; an overlap
    /// with a live lease held by another agent is rejected.
    pub fn reserve(
        &self,
        project_key: &str,
        agent: &str,
        file_glob: &str,
        ttl_secs: i64,
    ) -> Result<Reservation> {
        let now = Utc::now();
        let tx = self.database().conn().unchecked_transaction()?;

        tx.execute(
            "DELETE FROM reservations WHERE project_key = ?1 AND expires_at <= ?2",
            params![project_key, now.to_rfc3339()],
        )?;

        let held: Vec<(String, String)> = {
            let mut stmt = tx.prepare(
                "SELECT agent, file_glob FROM reservations
                 WHERE project_key = ?1 AND agent != ?2",
            )?;
            let rows = stmt.query_map(params![project_key, agent], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };
        for (owner, held_glob) in &held {
            if globs_overlap(file_glob, held_glob) {
                return Err(HiveError::ReservationConflict {
                    requested: file_glob.to_string(),
                    held: held_glob.clone(),
                    owner: owner.clone(),
                });
            }
        }

        // Re-leasing the same pattern refreshes the expiry.
        tx.execute(
            "DELETE FROM reservations WHERE project_key = ?1 AND agent = ?2 AND file_glob = ?3",
            params![project_key, agent, file_glob],
        )?;

        let reservation_id: i64 = tx.query_row(
            "SELECT COALESCE(MAX(id), 0) + 1 FROM reservations",
            [],
            |row| row.get(0),
        )?;
        let expires_at = now + Duration::seconds(ttl_secs.max(1));
        append_in_tx(
            &tx,
            events::RESERVATION_ACQUIRED,
            project_key,
            json!({
                "reservation_id": reservation_id,
                "agent": agent,
                "file_glob": file_glob,
                "expires_at": expires_at.to_rfc3339(),
            }),
        )?;
        tx.commit()?;

        self.get_reservation(project_key, reservation_id)?
            .ok_or_else(|| HiveError::NotFound {
                kind: "reservation",
                id: reservation_id.to_string(),
            })
    }

    pub fn release_reservation(&self, project_key: &str, reservation_id: i64) -> Result<()> {
        if self.get_reservation(project_key, reservation_id)?.is_none() {
            return Err(HiveError::NotFound {
                kind: "reservation",
                id: reservation_id.to_string(),
            });
        }
        self.append_event(
            events::RESERVATION_RELEASED,
            project_key,
            json!({ "reservation_id": reservation_id }),
        )?;
        Ok(())
    }

    pub fn get_reservation(
        &self,
        project_key: &str,
        reservation_id: i64,
    ) -> Result<Option<Reservation>> {
        self.database()
            .conn()
            .query_row(
                "SELECT id, project_key, agent, file_glob, acquired_at, expires_at
                 FROM reservations WHERE project_key = ?1 AND id = ?2",
                params![project_key, reservation_id],
                reservation_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Reservations for a project; `active_only` filters out expired leases
    /// that have not been pruned yet.
    pub fn list_reservations(
        &self,
        project_key: &str,
        active_only: bool,
    ) -> Result<Vec<Reservation>> {
        let mut stmt = self.database().conn().prepare(
            "SELECT id, project_key, agent, file_glob, acquired_at, expires_at
             FROM reservations WHERE project_key = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![project_key], reservation_from_row)?;
        let now = Utc::now();
        let mut reservations = Vec::new();
        for row in rows {
            let reservation = row?;
            if active_only && reservation.expires_at <= now {
                continue;
            }
            reservations.push(reservation);
        }
        Ok(reservations)
    }

    // -----------------------------------------------------------------------
    // Decision traces
    // -----------------------------------------------------------------------

    pub fn record_decision(&self, project_key: &str, trace: NewDecision) -> Result<DecisionTrace> {
        let id = Uuid::new_v4().to_string();
        let timestamp = Utc::now();
        self.append_event(
            events::DECISION_RECORDED,
            project_key,
            json!({
                "trace": {
                    "id": id,
                    "decision_type": trace.decision_type.to_string(),
                    "epic_id": trace.epic_id,
                    "bead_id": trace.bead_id,
                    "agent_name": trace.agent_name,
                    "decision": trace.decision,
                    "rationale": trace.rationale,
                    "inputs_gathered": trace.inputs_gathered,
                    "policy_evaluated": trace.policy_evaluated,
                    "alternatives": trace.alternatives,
                    "precedent_cited": trace.precedent_cited,
                    "outcome_event_id": trace.outcome_event_id,
                    "timestamp": timestamp.to_rfc3339(),
                }
            }),
        )?;
        self.get_decision(&id)?.ok_or(HiveError::NotFound {
            kind: "decision",
            id,
        })
    }

    pub fn get_decision(&self, id: &str) -> Result<Option<DecisionTrace>> {
        self.database()
            .conn()
            .query_row(
                "SELECT id, decision_type, epic_id, bead_id, agent_name, project_key,
                        decision, rationale, inputs_gathered, policy_evaluated,
                        alternatives, precedent_cited, outcome_event_id, timestamp
                 FROM decision_traces WHERE id = ?1",
                params![id],
                decision_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn list_decisions(
        &self,
        project_key: &str,
        bead_id: Option<&str>,
    ) -> Result<Vec<DecisionTrace>> {
        let mut sql = String::from(
            "SELECT id, decision_type, epic_id, bead_id, agent_name, project_key,
                    decision, rationale, inputs_gathered, policy_evaluated,
                    alternatives, precedent_cited, outcome_event_id, timestamp
             FROM decision_traces WHERE project_key = ?1",
        );
        if bead_id.is_some() {
            sql.push_str(" AND bead_id = ?2");
        }
        sql.push_str(" ORDER BY timestamp, id");
        let mut stmt = self.database().conn().prepare(&sql)?;
        let rows = match bead_id {
            Some(bead_id) => stmt.query_map(params![project_key, bead_id], decision_from_row)?,
            None => stmt.query_map(params![project_key], decision_from_row)?,
        };
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}

#[derive(Debug, Clone)]
pub struct NewDecision {
    pub decision_type: DecisionType,
    pub epic_id: Option<String>,
    pub bead_id: Option<String>,
    pub agent_name: String,
    pub decision: serde_json::Value,
    pub rationale: Option<String>,
    pub inputs_gathered: Option<serde_json::Value>,
    pub policy_evaluated: Option<serde_json::Value>,
    pub alternatives: Option<serde_json::Value>,
    pub precedent_cited: Option<serde_json::Value>,
    pub outcome_event_id: Option<i64>,
}

impl NewDecision {
    pub fn new(
        decision_type: DecisionType,
        agent_name: impl Into<String>,
        decision: serde_json::Value,
    ) -> Self {
        Self {
            decision_type,
            epic_id: None,
            bead_id: None,
            agent_name: agent_name.into(),
            decision,
            rationale: None,
            inputs_gathered: None,
            policy_evaluated: None,
            alternatives: None,
            precedent_cited: None,
            outcome_event_id: None,
        }
    }
}

fn decision_from_row(row: &Row<'_>) -> rusqlite::Result<DecisionTrace> {
    let parse_json = |value: Option<String>| value.and_then(|s| serde_json::from_str(&s).ok());
    Ok(DecisionTrace {
        id: row.get(0)?,
        decision_type: row
            .get::<_, String>(1)?
            .parse()
            .unwrap_or(DecisionType::StrategySelection),
        epic_id: row.get(2)?,
        bead_id: row.get(3)?,
        agent_name: row.get(4)?,
        project_key: row.get(5)?,
        decision: parse_json(row.get(6)?).unwrap_or(serde_json::Value::Null),
        rationale: row.get(7)?,
        inputs_gathered: parse_json(row.get(8)?),
        policy_evaluated: parse_json(row.get(9)?),
        alternatives: parse_json(row.get(10)?),
        precedent_cited: parse_json(row.get(11)?),
        outcome_event_id: row.get(12)?,
        timestamp: parse_dt(&row.get::<_, String>(13)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_list_and_heartbeat() {
        let store = HiveStore::open_memory().unwrap();
        let agent = store
            .register_agent("/repo", "builder-1", Some("claude-code"), Some("opus"))
            .unwrap();
        assert_eq!(agent.name, "builder-1");
        assert_eq!(agent.program.as_deref(), Some("claude-code"));

        store.touch_agent("/repo", "builder-1").unwrap();
        let agents = store.list_agents("/repo").unwrap();
        assert_eq!(agents.len(), 1);
        assert!(agents[0].last_seen_at >= agent.last_seen_at);

        let err = store.touch_agent("/repo", "ghost").unwrap_err();
        assert!(matches!(err, HiveError::NotFound { .. }));
    }

    #[test]
    fn stale_agents_are_cleaned_up_with_reservations() {
        let store = HiveStore::open_memory().unwrap();
        store.register_agent("/repo", "old", None, None).unwrap();
        store.reserve("/repo", "old", "src/**", 600).unwrap();
        // Backdate the heartbeat.
        store
            .database()
            .conn()
            .execute(
                "UPDATE agents SET last_seen_at = ?1 WHERE name = 'old'",
                params![(Utc::now() - Duration::hours(2)).to_rfc3339()],
            )
            .unwrap();

        let removed = store.cleanup_stale_agents("/repo", 3600).unwrap();
        assert_eq!(removed, vec!["old"]);
        assert!(store.list_agents("/repo").unwrap().is_empty());
        assert!(store.list_reservations("/repo", false).unwrap().is_empty());
    }

    #[test]
    fn message_delivery_and_read_tracking() {
        let store = HiveStore::open_memory().unwrap();
        let sent = store
            .send_message(
                "/repo",
                "coordinator",
                &["builder-1".into(), "builder-2".into()],
                Some("plan"),
                "start with the parser",
            )
            .unwrap();
        assert_eq!(sent.id, 1);
        assert!(sent.read_by.is_empty());

        let inbox = store
            .list_messages("/repo", Some("builder-1"), true)
            .unwrap();
        assert_eq!(inbox.len(), 1);

        store.mark_message_read("/repo", sent.id, "builder-1").unwrap();
        let inbox = store
            .list_messages("/repo", Some("builder-1"), true)
            .unwrap();
        assert!(inbox.is_empty());
        // builder-2 still sees it unread.
        let inbox = store
            .list_messages("/repo", Some("builder-2"), true)
            .unwrap();
        assert_eq!(inbox.len(), 1);
    }

    #[test]
    fn broadcast_recipient_matches_everyone() {
        let store = HiveStore::open_memory().unwrap();
        store
            .send_message("/repo", "coordinator", &["*".into()], None, "stand-up")
            .unwrap();
        let inbox = store.list_messages("/repo", Some("anyone"), true).unwrap();
        assert_eq!(inbox.len(), 1);
    }

    #[test]
    fn reservation_conflicts_on_overlapping_globs() {
        let store = HiveStore::open_memory().unwrap();
        store.reserve("/repo", "a", "src/store/**", 600).unwrap();
        let err = store.reserve("/repo", "b", "src/**", 600).unwrap_err();
        assert!(matches!(err, HiveError::ReservationConflict { .. }));

        // Disjoint prefix is fine.
        store.reserve("/repo", "b", "docs/**", 600).unwrap();
        assert_eq!(store.list_reservations("/repo", true).unwrap().len(), 2);
    }

    #[test]
    fn expired_reservations_are_pruned_on_acquire() {
        let store = HiveStore::open_memory().unwrap();
        let lease = store.reserve("/repo", "a", "src/**", 600).unwrap();
        store
            .database()
            .conn()
            .execute(
                "UPDATE reservations SET expires_at = ?1 WHERE id = ?2",
                params![(Utc::now() - Duration::minutes(1)).to_rfc3339(), lease.id],
            )
            .unwrap();
        // Another agent can now take the overlapping lease.
        let taken = store.reserve("/repo", "b", "src/**", 600).unwrap();
        assert_eq!(taken.agent, "b");
        assert_eq!(store.list_reservations("/repo", true).unwrap().len(), 1);
    }

    #[test]
    fn release_removes_the_lease() {
        let store = HiveStore::open_memory().unwrap();
        let lease = store.reserve("/repo", "a", "src/**", 600).unwrap();
        store.release_reservation("/repo", lease.id).unwrap();
        assert!(store.list_reservations("/repo", false).unwrap().is_empty());
        let err = store.release_reservation("/repo", lease.id).unwrap_err();
        assert!(matches!(err, HiveError::NotFound { .. }));
    }

    #[test]
    fn decision_traces_round_trip() {
        let store = HiveStore::open_memory().unwrap();
        let mut decision = NewDecision::new(
            DecisionType::WorkerSpawn,
            "coordinator",
            json!({ "worker": "builder-3", "scope": "parser" }),
        );
        decision.bead_id = Some("bd-1".into());
        decision.rationale = Some("parser is on the critical path".into());
        let recorded = store.record_decision("/repo", decision).unwrap();
        assert_eq!(recorded.decision_type, DecisionType::WorkerSpawn);
        assert_eq!(recorded.decision["worker"], "builder-3");

        let listed = store.list_decisions("/repo", Some("bd-1")).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, recorded.id);
        assert!(store.list_decisions("/repo", Some("bd-2")).unwrap().is_empty());
    }

    #[test]
    fn glob_overlap_rules() {
        assert!(globs_overlap("src/**", "src/store/**"));
        assert!(globs_overlap("src/store/**", "src/**"));
        assert!(globs_overlap("src/lib.rs", "src/lib.rs"));
        assert!(!globs_overlap("src/**", "docs/**"));
        assert!(!globs_overlap("src/lib.rs", "src/lib2.rs"));
        // Bare wildcard conflicts with everything.
        assert!(globs_overlap("*", "docs/**"));
    }
}

//! Fire-and-forget audit sink.
//!
//! Records land in the `audit_log` table from a detached task; a failed
//! write is logged and swallowed so auditing never blocks or fails the
//! primary operation.

use tracing::warn;

use crate::db::DbHandle;

#[derive(Clone)]
pub struct Audit {
    db: DbHandle,
}

impl Audit {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    pub fn record(&self, actor: &str, action: &str, subject: &str, detail: Option<String>) {
        let db = self.db.clone();
        let actor = actor.to_string();
        let action = action.to_string();
        let subject = subject.to_string();
        tokio::spawn(async move {
            let result = db
                .call(move |db| db.insert_audit(&actor, &action, &subject, detail.as_deref()))
                .await;
            if let Err(e) = result {
                warn!("audit write failed: {:#}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::VigilDb;

    #[tokio::test]
    async fn record_is_fire_and_forget() {
        let db = DbHandle::new(VigilDb::new_in_memory().unwrap());
        let audit = Audit::new(db);
        audit.record("u1", "run.create", "r1", Some("tool=nmap".into()));
        // Nothing to assert beyond "does not block or panic"; give the
        // detached task a beat to land.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local, SecondsFormat, TimeZone};
use mailparse::{addrparse, dateparse, MailAddr, SingleInfo};
use rusqlite::{params, Connection, OptionalExtension};

use super::{MessageStore, StoreError};
use crate::message::{Envelope, Message, Metadata};
use crate::record::EvalRecord;

/// Durable message store backed by an embedded SQLite database.
///
/// The connection is shared across request tasks behind a mutex; every
/// operation is a short statement or a single transaction, so the
/// blocking window stays narrow.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`. The parent
    /// directory is created with mode `0700`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent() {
            create_private_dir(dir)?;
        }
        let conn = Connection::open(path)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open a throwaway in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("store lock poisoned")
    }

    /// Run raw SQL against the underlying connection. Test hook for
    /// simulating mid-transaction failures and inspecting rows.
    #[doc(hidden)]
    pub fn with_connection<R>(&self, f: impl FnOnce(&Connection) -> R) -> R {
        f(&self.lock())
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS message(
    id              TEXT    PRIMARY KEY,
    insert_time     TEXT    NOT NULL,
    is_sampled      INTEGER NOT NULL,
    send_time       TEXT,
    from_address    TEXT,
    from_alias      TEXT,
    to_address      TEXT,
    to_alias        TEXT,
    to_list         TEXT,
    subject         TEXT,
    cc_address      TEXT,
    cc_alias        TEXT,
    cc_list         TEXT,
    sender_address  TEXT,
    sender_alias    TEXT,
    in_reply_to_id  TEXT,
    thread_topic    TEXT,
    main_header_json TEXT,
    full_text       BLOB
);

CREATE TABLE IF NOT EXISTS message_tag(
    id              INTEGER PRIMARY KEY,
    message_id      TEXT    NOT NULL,
    "key"           TEXT    NOT NULL,
    "value"         TEXT,
    create_time     TEXT    NOT NULL,
    create_group    TEXT    NOT NULL,
    create_rule     TEXT    NOT NULL,
    update_time     TEXT    NOT NULL,
    update_group    TEXT    NOT NULL,
    update_rule     TEXT    NOT NULL,

    FOREIGN KEY(message_id) REFERENCES message(id)
);

CREATE UNIQUE INDEX IF NOT EXISTS iu_message_tag_on_message_id_key
                 ON message_tag(message_id, "key");

CREATE TABLE IF NOT EXISTS group_eval(
    id              INTEGER PRIMARY KEY,
    message_id      TEXT    NOT NULL,
    group_name      TEXT    NOT NULL,
    start_time      TEXT    NOT NULL,
    end_time        TEXT    NOT NULL,
    eval_seconds    REAL    NOT NULL,
    stop            INTEGER,
    error           TEXT,

    FOREIGN KEY(message_id) REFERENCES message(id)
);

CREATE INDEX IF NOT EXISTS i_group_eval_on_message_id_id
          ON group_eval(message_id, id);

CREATE TABLE IF NOT EXISTS rule_eval(
    id              INTEGER PRIMARY KEY,
    group_eval_id   INTEGER NOT NULL,
    rule_name       TEXT    NOT NULL,
    start_time      TEXT    NOT NULL,
    end_time        TEXT    NOT NULL,
    eval_seconds    REAL    NOT NULL,
    is_match        INTEGER NOT NULL,
    error           TEXT,

    FOREIGN KEY(group_eval_id) REFERENCES group_eval(id)
);

CREATE INDEX IF NOT EXISTS i_rule_eval_on_group_eval_id_id
          ON rule_eval(group_eval_id, id);
"#,
    )
}

/// ISO-8601 with millisecond precision and explicit zone offset.
fn fmt_time(t: &DateTime<Local>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, false)
}

fn eval_seconds(start: &DateTime<Local>, end: &DateTime<Local>) -> f64 {
    (*end - *start).num_milliseconds() as f64 / 1000.0
}

/// Split an address header the way the schema wants it: exactly one
/// mailbox yields (address, alias); more than one keeps the raw value
/// as a list; an absent or unparseable header yields nothing.
fn parse_address_list(
    envelope: &Envelope,
    header: &str,
) -> (Option<String>, Option<String>, Option<String>) {
    let Some(raw) = envelope.header(header) else {
        return (None, None, None);
    };
    let Ok(addrs) = addrparse(raw) else {
        return (None, None, None);
    };
    let singles: Vec<&SingleInfo> = addrs
        .iter()
        .flat_map(|a| match a {
            MailAddr::Single(s) => std::slice::from_ref(s).iter(),
            MailAddr::Group(g) => g.addrs.iter(),
        })
        .collect();
    match singles.as_slice() {
        [] => (None, None, None),
        [single] => (Some(single.addr.clone()), single.display_name.clone(), None),
        _ => (None, None, Some(raw.to_string())),
    }
}

fn optional_header(envelope: &Envelope, header: &str) -> Option<String> {
    envelope.header(header).map(str::to_string)
}

fn headers_as_json(envelope: &Envelope) -> Result<String, serde_json::Error> {
    let map: HashMap<&str, &str> = envelope.headers().collect();
    serde_json::to_string(&map)
}

impl MessageStore for SqliteStore {
    fn get_metadata(&self, store_id: &str) -> Result<Option<Metadata>, StoreError> {
        let conn = self.lock();

        let sampled: Option<bool> = conn
            .query_row(
                "SELECT is_sampled FROM message WHERE id = ?1",
                params![store_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(sampled) = sampled else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            r#"SELECT "key", "value" FROM message_tag
               WHERE message_id = ?1 AND "value" IS NOT NULL"#,
        )?;
        let tags = stmt
            .query_map(params![store_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<HashMap<_, _>, _>>()?;

        Ok(Some(Metadata::new(sampled, tags)))
    }

    fn put_message(&self, store_id: &str, msg: &Message) -> Result<(), StoreError> {
        let envelope = msg.envelope();
        let insert_time = fmt_time(&Local::now());
        let is_sampled = msg.is_sampled();

        let send_time = match envelope.header("Date") {
            Some(date) => {
                let secs = dateparse(date).map_err(|e| StoreError::BadDate(e.to_string()))?;
                let t = Local
                    .timestamp_opt(secs, 0)
                    .single()
                    .ok_or_else(|| StoreError::BadDate(format!("out of range: {secs}")))?;
                Some(fmt_time(&t))
            }
            None => None,
        };

        let (from_address, from_alias, _) = parse_address_list(envelope, "From");
        let (to_address, to_alias, to_list) = parse_address_list(envelope, "To");
        let (cc_address, cc_alias, cc_list) = parse_address_list(envelope, "CC");
        let (sender_address, sender_alias, _) = parse_address_list(envelope, "Sender");
        let (in_reply_to_id, _, _) = parse_address_list(envelope, "In-Reply-To");
        let subject = optional_header(envelope, "Subject");
        let thread_topic = optional_header(envelope, "Thread-Topic");

        let (main_header_json, full_text) = if is_sampled {
            (Some(headers_as_json(envelope)?), Some(msg.full_text()))
        } else {
            (None, None)
        };

        self.lock().execute(
            "INSERT INTO message(
                 id, insert_time, is_sampled, send_time,
                 from_address, from_alias, to_address, to_alias, to_list,
                 subject, cc_address, cc_alias, cc_list,
                 sender_address, sender_alias,
                 in_reply_to_id, thread_topic, main_header_json, full_text)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                     ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
             ON CONFLICT(id) DO NOTHING",
            params![
                store_id,
                insert_time,
                is_sampled,
                send_time,
                from_address,
                from_alias,
                to_address,
                to_alias,
                to_list,
                subject,
                cc_address,
                cc_alias,
                cc_list,
                sender_address,
                sender_alias,
                in_reply_to_id,
                thread_topic,
                main_header_json,
                full_text,
            ],
        )?;

        Ok(())
    }

    fn record_eval(&self, store_id: &str, rec: &EvalRecord) -> Result<(), StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        // A chain that errored has no terminal stop flag.
        let error = rec.first_error();
        let stop: Option<bool> = if error.is_some() { None } else { Some(false) };

        tx.execute(
            "INSERT INTO group_eval(
                 message_id, group_name, start_time, end_time,
                 eval_seconds, stop, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                store_id,
                rec.group,
                fmt_time(&rec.start),
                fmt_time(&rec.end),
                eval_seconds(&rec.start, &rec.end),
                stop,
                error,
            ],
        )?;
        let group_eval_id = tx.last_insert_rowid();

        for rule in &rec.rules {
            tx.execute(
                "INSERT INTO rule_eval(
                     group_eval_id, rule_name, start_time, end_time,
                     eval_seconds, is_match, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    group_eval_id,
                    rule.rule,
                    fmt_time(&rule.start),
                    fmt_time(&rule.end),
                    eval_seconds(&rule.start, &rule.end),
                    rule.matched,
                    rule.error,
                ],
            )?;

            for change in &rule.tag_changes {
                let time = fmt_time(&change.time);
                tx.execute(
                    r#"INSERT INTO message_tag(
                           message_id, "key", "value",
                           create_time, create_group, create_rule,
                           update_time, update_group, update_rule)
                       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?4, ?5, ?6)
                       ON CONFLICT(message_id, "key") DO UPDATE SET
                           "value" = excluded."value",
                           update_time = excluded.update_time,
                           update_group = excluded.update_group,
                           update_rule = excluded.update_rule"#,
                    params![store_id, change.key, change.value, time, rec.group, rule.rule],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }
}

use rusqlite::Connection;

use smsq_core::Result;

use crate::db_err;

/// Create tables if missing. Safe to run on every open.
pub(crate) fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS owners (
            id TEXT PRIMARY KEY,
            parent TEXT                       -- admin account of a sub-account
        );

        -- rowid order is contact insertion order
        CREATE TABLE IF NOT EXISTS contacts (
            owner TEXT NOT NULL,
            phone_number TEXT NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            groups TEXT NOT NULL DEFAULT '[]' -- JSON array
        );
        CREATE INDEX IF NOT EXISTS contacts_owner ON contacts(owner);
        CREATE INDEX IF NOT EXISTS contacts_phone ON contacts(phone_number);

        CREATE TABLE IF NOT EXISTS opt_outs (
            phone_number TEXT NOT NULL,
            owner TEXT NOT NULL,
            reason TEXT NOT NULL,
            scope TEXT NOT NULL,              -- 'platform' | 'owner'
            added_at TEXT NOT NULL,
            UNIQUE (phone_number, owner)
        );

        CREATE TABLE IF NOT EXISTS campaigns (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            owner TEXT NOT NULL,
            contact_groups TEXT NOT NULL,     -- JSON array
            message TEXT NOT NULL,
            batch_size INTEGER NOT NULL,
            buffer_minutes INTEGER NOT NULL,
            throttle TEXT NOT NULL,
            sender TEXT NOT NULL,
            include_opt_out INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS campaigns_sender ON campaigns(sender);
        CREATE INDEX IF NOT EXISTS campaigns_owner ON campaigns(owner);

        CREATE TABLE IF NOT EXISTS queue_entries (
            id TEXT PRIMARY KEY,
            campaign TEXT NOT NULL REFERENCES campaigns(id),
            owner TEXT NOT NULL,
            status TEXT NOT NULL,
            current_batch INTEGER NOT NULL DEFAULT 0,
            total_batches INTEGER NOT NULL,
            scheduled_at TEXT NOT NULL,
            task TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            CHECK (current_batch >= 0 AND current_batch <= total_batches AND total_batches >= 1)
        );
        CREATE INDEX IF NOT EXISTS queue_entries_owner ON queue_entries(owner);

        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            external_id TEXT,                 -- NULL: carrier never accepted the send
            sender TEXT NOT NULL,
            recipient TEXT NOT NULL,
            body TEXT NOT NULL,
            sent_at TEXT NOT NULL,
            direction TEXT NOT NULL,
            content_kind TEXT NOT NULL,
            status TEXT NOT NULL,
            campaigns TEXT NOT NULL DEFAULT '[]',
            owners TEXT NOT NULL DEFAULT '[]',
            keyword TEXT
        );
        CREATE INDEX IF NOT EXISTS messages_receipt ON messages(sender, recipient, external_id);
        -- a redelivered inbound callback carries the same carrier id
        CREATE UNIQUE INDEX IF NOT EXISTS messages_reply_once
            ON messages(sender, recipient, external_id)
            WHERE direction = 'reply' AND external_id IS NOT NULL;
        ",
    )
    .map_err(db_err)
}

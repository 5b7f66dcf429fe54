//! Database schema and migrations for the chat relay.
//!
//! Migrations are applied in order when the database is opened. The
//! schema_version table tracks which ones have run.

/// Database migrations.
///
/// Each migration is a SQL script that will be executed in order.
pub const MIGRATIONS: &[&str] = &[
    // v1: Users known to the relay (created lazily from verified identities)
    r#"
CREATE TABLE users (
    id          TEXT PRIMARY KEY,        -- token subject
    username    TEXT NOT NULL,           -- preferred_username at first sight
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX idx_users_username ON users(username);
"#,
    // v2: Rooms and their participants
    r#"
CREATE TABLE rooms (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL DEFAULT '',
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE room_participants (
    room_id     TEXT NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
    user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    joined_at   TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (room_id, user_id)
);

CREATE INDEX idx_room_participants_user_id ON room_participants(user_id);
"#,
    // v3: Append-only message log
    r#"
CREATE TABLE messages (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    room_id     TEXT NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
    sender      TEXT NOT NULL,           -- display name of the verified identity
    content     TEXT NOT NULL,
    timestamp   TEXT NOT NULL            -- RFC 3339, UTC
);

CREATE INDEX idx_messages_room_id ON messages(room_id, id);
"#,
];

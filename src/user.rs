//! User accounts and the wire password-hash scheme. The plaintext password
//! never travels the wire: the client hashes `H(user_salt || password)`
//! once at account
//! creation and stores that; at login it's handed a fresh per-session salt
//! and sends `H(session_salt || stored_hash)`, so a captured wire value
//! can't be replayed against a different session.

use color_eyre::Result;
use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::error::ErrorCode;

#[derive(Debug, Clone)]
pub struct User {
    pub id: u32,
    pub login: String,
    pub salt: Vec<u8>,
    pub stored_password_hash: Vec<u8>,
}

/// `H(salt || data)`. Spec §6 fixes the *file* hash to SHA-1+MD5 for
/// interoperability with existing history but names no concrete primitive
/// for the wire password hash; this crate resolves that Open Question with
/// SHA-256 (see DESIGN.md).
pub fn hash_with_salt(salt: &[u8], data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(data);
    hasher.finalize().to_vec()
}

pub fn hash_password(user_salt: &[u8], password: &str) -> Vec<u8> {
    hash_with_salt(user_salt, password.as_bytes())
}

pub fn hash_password_for_session(session_salt: &[u8], stored_password_hash: &[u8]) -> Vec<u8> {
    hash_with_salt(session_salt, stored_password_hash)
}

pub fn find_by_login(db: &Connection, login: &str) -> Result<Option<User>> {
    db.query_row(
        "SELECT id, login, salt, password FROM user WHERE login = ?1",
        [login],
        |row| {
            Ok(User {
                id: row.get(0)?,
                login: row.get(1)?,
                salt: row.get(2)?,
                stored_password_hash: row.get(3)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

pub fn find_by_id(db: &Connection, id: u32) -> Result<Option<User>> {
    db.query_row(
        "SELECT id, login, salt, password FROM user WHERE id = ?1",
        [id],
        |row| {
            Ok(User {
                id: row.get(0)?,
                login: row.get(1)?,
                salt: row.get(2)?,
                stored_password_hash: row.get(3)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

pub fn list_all(db: &Connection) -> Result<Vec<User>> {
    let mut stmt = db.prepare("SELECT id, login, salt, password FROM user ORDER BY id")?;
    let rows = stmt.query_map([], |row| {
        Ok(User {
            id: row.get(0)?,
            login: row.get(1)?,
            salt: row.get(2)?,
            stored_password_hash: row.get(3)?,
        })
    })?;
    rows.collect::<rusqlite::Result<_>>().map_err(Into::into)
}

/// Register a new account. `salt` and `stored_password_hash` are supplied
/// by the caller (already `hash_password`'d client-side, per the wire
/// scheme) rather than computed here, matching the two-message
/// Initiate/Finish account creation flow: the salt is handed out first so
/// the client can hash with it before the account row actually exists.
pub fn register(db: &Connection, login: &str, salt: &[u8], stored_password_hash: &[u8]) -> Result<Result<u32, ErrorCode>> {
    if login.is_empty() || login.len() > 63 {
        return Ok(Err(ErrorCode::InvalidUserAccountName));
    }
    if find_by_login(db, login)?.is_some() {
        return Ok(Err(ErrorCode::UserAccountAlreadyExists));
    }
    db.execute(
        "INSERT INTO user (login, salt, password) VALUES (?1, ?2, ?3)",
        (login, salt, stored_password_hash),
    )?;
    Ok(Ok(db.last_insert_rowid() as u32))
}

/// Verify a login attempt. `session_salt` is the per-session salt handed
/// out at the start of the login exchange; `hashed_for_session` is what the
/// client sent back, `H(session_salt || H(user_salt || password))`.
pub fn verify_login(db: &Connection, login: &str, session_salt: &[u8], hashed_for_session: &[u8]) -> Result<Result<User, ErrorCode>> {
    let Some(user) = find_by_login(db, login)? else {
        return Ok(Err(ErrorCode::UserLoginAuthenticationFailed));
    };
    let expected = hash_password_for_session(session_salt, &user.stored_password_hash);
    if expected == hashed_for_session {
        Ok(Ok(user))
    } else {
        Ok(Err(ErrorCode::UserLoginAuthenticationFailed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        let db = Connection::open_in_memory().unwrap();
        db.execute_batch(
            "CREATE TABLE user (id INTEGER PRIMARY KEY AUTOINCREMENT, login TEXT UNIQUE, salt BLOB, password TEXT);",
        )
        .unwrap();
        db
    }

    #[test]
    fn register_then_login_round_trips() {
        let db = test_db();
        let user_salt = b"usersalt".to_vec();
        let stored = hash_password(&user_salt, "hunter2");
        let id = register(&db, "alice", &user_salt, &stored).unwrap().unwrap();
        assert_ne!(id, 0);

        let session_salt = b"sessionsalt";
        let sent = hash_password_for_session(session_salt, &stored);
        let user = verify_login(&db, "alice", session_salt, &sent).unwrap().unwrap();
        assert_eq!(user.id, id);
    }

    #[test]
    fn wrong_password_fails_login() {
        let db = test_db();
        let user_salt = b"usersalt".to_vec();
        let stored = hash_password(&user_salt, "hunter2");
        register(&db, "alice", &user_salt, &stored).unwrap().unwrap();

        let session_salt = b"sessionsalt";
        let wrong_stored = hash_password(&user_salt, "wrongpassword");
        let sent = hash_password_for_session(session_salt, &wrong_stored);
        let result = verify_login(&db, "alice", session_salt, &sent).unwrap();
        assert_eq!(result.unwrap_err(), ErrorCode::UserLoginAuthenticationFailed);
    }

    #[test]
    fn duplicate_login_is_rejected() {
        let db = test_db();
        register(&db, "alice", b"s", b"h").unwrap().unwrap();
        let result = register(&db, "alice", b"s2", b"h2").unwrap();
        assert_eq!(result.unwrap_err(), ErrorCode::UserAccountAlreadyExists);
    }

    #[test]
    fn plaintext_password_never_appears_in_wire_value() {
        let user_salt = b"usersalt".to_vec();
        let password = "hunter2";
        let stored = hash_password(&user_salt, password);
        let session_salt = b"sessionsalt";
        let wire_value = hash_password_for_session(session_salt, &stored);
        assert!(!wire_value.windows(password.len()).any(|w| w == password.as_bytes()));
    }
}

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;

use crate::error::{Error, Result};
use crate::sqlpool::SqlConnPool;

/// Hash a plaintext password with Argon2 for storage.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::Auth(format!("failed to hash password: {e}")))
}

/// Verify a plaintext password against a stored Argon2 hash.
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed = PasswordHash::new(hash)
        .map_err(|e| Error::Auth(format!("invalid stored password hash: {e}")))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Check credentials against the `user(username, password)` table.
///
/// Login succeeds when the name exists and the password verifies.
/// Registration succeeds when the name is unused; the new row stores an
/// Argon2 hash, never the plaintext. All statements are parameterized.
pub fn user_verify(pool: &SqlConnPool, name: &str, pwd: &str, is_login: bool) -> Result<bool> {
    if name.is_empty() || pwd.is_empty() {
        return Ok(false);
    }

    let mut conn = pool.acquire()?;
    let row = conn.query_opt(
        r#"SELECT password FROM "user" WHERE username = $1 LIMIT 1"#,
        &[&name],
    )?;

    if is_login {
        match row {
            Some(row) => verify_password(pwd, row.get::<_, &str>(0)),
            None => Ok(false),
        }
    } else {
        if row.is_some() {
            // Name already taken.
            return Ok(false);
        }
        let hash = hash_password(pwd)?;
        conn.execute(
            r#"INSERT INTO "user" (username, password) VALUES ($1, $2)"#,
            &[&name, &hash],
        )?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlpool::SqlConfig;

    #[test]
    #[ignore] // requires a reachable postgres with a writable `user` table
    fn register_then_login_round_trips_through_the_pool() {
        let cfg = SqlConfig {
            host: "127.0.0.1".into(),
            user: std::env::var("PGUSER").unwrap_or_else(|_| "postgres".into()),
            password: std::env::var("PGPASSWORD").unwrap_or_default(),
            dbname: std::env::var("PGDATABASE").unwrap_or_else(|_| "postgres".into()),
            pool_size: 2,
            ..Default::default()
        };
        let pool = SqlConnPool::connect(&cfg).unwrap();
        {
            let mut conn = pool.acquire().unwrap();
            conn.batch_execute(
                r#"CREATE TABLE IF NOT EXISTS "user" (username TEXT PRIMARY KEY, password TEXT NOT NULL);
                   DELETE FROM "user" WHERE username = 'new_user'"#,
            )
            .unwrap();
        }

        // Fresh name registers and the stored secret is a hash.
        assert!(user_verify(&pool, "new_user", "p", false).unwrap());
        {
            let mut conn = pool.acquire().unwrap();
            let row = conn
                .query_one(r#"SELECT password FROM "user" WHERE username = 'new_user'"#, &[])
                .unwrap();
            assert!(row.get::<_, String>(0).starts_with("$argon2"));
        }

        // Second identical registration is rejected.
        assert!(!user_verify(&pool, "new_user", "p", false).unwrap());

        // Login with the right and wrong password.
        assert!(user_verify(&pool, "new_user", "p", true).unwrap());
        assert!(!user_verify(&pool, "new_user", "wrong", true).unwrap());
        assert!(!user_verify(&pool, "absent", "p", true).unwrap());
    }

    #[test]
    fn hash_then_verify_round_trips() {
        let hash = hash_password("hunter2").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("hunter2", &hash).unwrap());
        assert!(!verify_password("hunter3", &hash).unwrap());
    }

    #[test]
    fn garbage_hash_is_an_error_not_a_match() {
        assert!(verify_password("x", "not-a-phc-string").is_err());
    }
}

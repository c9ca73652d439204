//! Subject storage: accounts, passwords and role sets.

use tracing::info;

use crate::auth::credentials::{hash_password, verify_password};
use crate::auth::store::{StoreError, StoreResult};
use crate::db::{Db, RoleAssignmentRecord, SubjectRecord};
use crate::types::{SubjectId, Username};

/// Payload for creating a subject.
#[derive(Debug, Clone)]
pub struct NewSubject {
    pub username: Username,
    pub email: String,
    pub password: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl NewSubject {
    pub fn new(
        username: impl Into<Username>,
        email: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            email: email.into(),
            password: password.into(),
            first_name: None,
            last_name: None,
        }
    }
}

fn is_unique_violation(e: &surrealdb::Error) -> bool {
    e.to_string().contains("already contains")
}

/// Subject store for database operations.
#[derive(Clone)]
pub struct SubjectStore {
    db: Db,
}

impl SubjectStore {
    /// Create a new subject store.
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Create a subject with a freshly hashed password.
    ///
    /// Fails with `Conflict` when the username or email is taken.
    pub async fn create_subject(&self, new: NewSubject) -> StoreResult<SubjectRecord> {
        if self.get_by_username(&new.username).await?.is_some() {
            return Err(StoreError::Conflict("Username already exists".to_string()));
        }
        if self.email_taken(&new.email).await? {
            return Err(StoreError::Conflict("Email already exists".to_string()));
        }

        let password_hash =
            hash_password(&new.password).map_err(|e| StoreError::Database(e.to_string()))?;
        let subject_id = SubjectId::new(uuid::Uuid::new_v4().to_string());

        let query = r#"
            CREATE subject CONTENT {
                subject_id: $subject_id,
                username: $username,
                email: $email,
                password_hash: $password_hash,
                first_name: $first_name,
                last_name: $last_name,
                is_active: true
            }
        "#;

        let result = self
            .db
            .query(query)
            .bind(("subject_id", subject_id))
            .bind(("username", new.username.clone()))
            .bind(("email", new.email))
            .bind(("password_hash", password_hash))
            .bind(("first_name", new.first_name))
            .bind(("last_name", new.last_name))
            .await?
            .take::<Vec<SubjectRecord>>(0);

        // A concurrent insert can still lose the race on the unique index
        let subjects = match result {
            Ok(subjects) => subjects,
            Err(e) if is_unique_violation(&e) => {
                return Err(StoreError::Conflict("Username or email already exists".to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let subject = subjects
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Database("Failed to create subject".to_string()))?;

        info!(subject_id = %subject.subject_id, username = %subject.username, "Created subject");
        Ok(subject)
    }

    /// Check a username/password pair.
    ///
    /// Unknown usernames and wrong passwords both report `NotFound`.
    /// Deactivated subjects report `SubjectInactive`.
    pub async fn authenticate(&self, username: &str, password: &str) -> StoreResult<SubjectRecord> {
        let subject = self
            .get_by_username(&Username::new(username))
            .await?
            .ok_or(StoreError::NotFound)?;

        let matches = verify_password(password, &subject.password_hash)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        if !matches {
            return Err(StoreError::NotFound);
        }
        if !subject.is_active {
            return Err(StoreError::SubjectInactive);
        }

        Ok(subject)
    }

    /// Get a subject by its public ID.
    pub async fn get_subject(&self, subject_id: &SubjectId) -> StoreResult<Option<SubjectRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM subject WHERE subject_id = $subject_id LIMIT 1")
            .bind(("subject_id", subject_id.clone()))
            .await?;

        let subjects: Vec<SubjectRecord> = res.take(0)?;
        Ok(subjects.into_iter().next())
    }

    /// Get a subject by username.
    pub async fn get_by_username(&self, username: &Username) -> StoreResult<Option<SubjectRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM subject WHERE username = $username LIMIT 1")
            .bind(("username", username.clone()))
            .await?;

        let subjects: Vec<SubjectRecord> = res.take(0)?;
        Ok(subjects.into_iter().next())
    }

    async fn email_taken(&self, email: &str) -> StoreResult<bool> {
        let mut res = self
            .db
            .query("SELECT * FROM subject WHERE email = $email LIMIT 1")
            .bind(("email", email.to_string()))
            .await?;

        let subjects: Vec<SubjectRecord> = res.take(0)?;
        Ok(!subjects.is_empty())
    }

    /// Activate or deactivate a subject.
    pub async fn set_active(&self, subject_id: &SubjectId, active: bool) -> StoreResult<()> {
        let query = r#"
            UPDATE subject SET is_active = $active
            WHERE subject_id = $subject_id
            RETURN AFTER
        "#;

        let mut res = self
            .db
            .query(query)
            .bind(("active", active))
            .bind(("subject_id", subject_id.clone()))
            .await?;

        let updated: Vec<SubjectRecord> = res.take(0)?;
        if updated.is_empty() {
            return Err(StoreError::NotFound);
        }

        info!(subject_id = %subject_id, active, "Changed subject activation");
        Ok(())
    }

    /// Replace a subject's whole role set in one transaction.
    ///
    /// If any insert fails, the previous role set is left untouched.
    pub async fn replace_roles(
        &self,
        subject_id: &SubjectId,
        roles: Vec<String>,
    ) -> StoreResult<Vec<String>> {
        let query = r#"
            BEGIN TRANSACTION;
            DELETE subject_role WHERE subject_id = $subject_id;
            FOR $role IN $roles {
                CREATE subject_role CONTENT { subject_id: $subject_id, role: $role };
            };
            COMMIT TRANSACTION;
        "#;

        self.db
            .query(query)
            .bind(("subject_id", subject_id.clone()))
            .bind(("roles", roles))
            .await?
            .check()?;

        self.list_roles(subject_id).await
    }

    /// List a subject's roles in alphabetical order.
    pub async fn list_roles(&self, subject_id: &SubjectId) -> StoreResult<Vec<String>> {
        let mut res = self
            .db
            .query("SELECT * FROM subject_role WHERE subject_id = $subject_id ORDER BY role ASC")
            .bind(("subject_id", subject_id.clone()))
            .await?;

        let rows: Vec<RoleAssignmentRecord> = res.take(0)?;
        Ok(rows.into_iter().map(|r| r.role).collect())
    }
}

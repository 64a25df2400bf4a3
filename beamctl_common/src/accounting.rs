//! Users, projects and the session privilege state.
//!
//! The user database is a serialized list of users and projects kept in
//! a JSON file resolved relative to the configuration directory.
//! Authentication back-ends are external; this module only carries the
//! privilege-check contract: the session privilege can be lowered at
//! will but never raised above the selected user's maximum.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::privilege::{Privilege, PrivilegeError};

/// A registered user of the instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub firstname: String,
    pub lastname: String,
    /// Maximum privilege this user may ever hold.
    pub max_privilege: Privilege,
    #[serde(default)]
    pub email: String,
    /// SHA-512 hex digest; `None` disables local password checks.
    #[serde(default)]
    pub password_hash: Option<String>,
}

/// A measurement project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub proposer: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UserDatabase {
    users: Vec<User>,
    projects: Vec<Project>,
}

/// The accounting service: user/project registry plus session state.
#[derive(Debug)]
pub struct Accounting {
    dbfile: PathBuf,
    users: Vec<User>,
    projects: Vec<Project>,
    current_user: Option<String>,
    current_project: Option<String>,
    privilege: Privilege,
}

impl Accounting {
    /// Open the user database file under the configuration directory,
    /// creating an empty registry if the file does not exist yet.
    ///
    /// Until a user is selected the session runs with superuser
    /// privileges, as on a freshly installed instrument.
    pub fn open(configdir: &Path, dbfile: &str) -> Result<Self, StoreError> {
        let dbfile = configdir.join(dbfile);
        let db = if dbfile.exists() {
            let content = std::fs::read_to_string(&dbfile)
                .map_err(|e| StoreError::Persistence(e.to_string()))?;
            serde_json::from_str::<UserDatabase>(&content)
                .map_err(|e| StoreError::Persistence(e.to_string()))?
        } else {
            UserDatabase::default()
        };
        Ok(Self {
            dbfile,
            users: db.users,
            projects: db.projects,
            current_user: None,
            current_project: None,
            privilege: Privilege::Superuser,
        })
    }

    /// In-memory registry for tests and tools.
    pub fn in_memory() -> Self {
        Self {
            dbfile: PathBuf::new(),
            users: Vec::new(),
            projects: Vec::new(),
            current_user: None,
            current_project: None,
            privilege: Privilege::Superuser,
        }
    }

    fn persist(&self) -> Result<(), StoreError> {
        if self.dbfile.as_os_str().is_empty() {
            return Ok(());
        }
        let db = UserDatabase {
            users: self.users.clone(),
            projects: self.projects.clone(),
        };
        let serialized = serde_json::to_string_pretty(&db)
            .map_err(|e| StoreError::Persistence(e.to_string()))?;
        std::fs::write(&self.dbfile, serialized)
            .map_err(|e| StoreError::Persistence(e.to_string()))
    }

    // ─── Privilege contract ────────────────────────────────────────

    /// The effective session privilege.
    pub fn privilege(&self) -> Privilege {
        self.privilege
    }

    /// Maximum privilege the session could hold.
    pub fn max_privilege(&self) -> Privilege {
        match self.current_user() {
            Some(user) => user.max_privilege,
            None => Privilege::Superuser,
        }
    }

    /// Check that the session covers `required`.
    pub fn require(&self, required: Privilege) -> Result<(), PrivilegeError> {
        if self.privilege.allows(required) {
            Ok(())
        } else {
            Err(PrivilegeError {
                required,
                held: self.privilege,
            })
        }
    }

    /// Change the effective privilege. Lowering is always allowed;
    /// raising is capped at the current user's maximum.
    pub fn set_privilege(&mut self, level: Privilege) -> Result<(), PrivilegeError> {
        let max = self.max_privilege();
        if level > max {
            return Err(PrivilegeError {
                required: level,
                held: max,
            });
        }
        self.privilege = level;
        Ok(())
    }

    // ─── Users ─────────────────────────────────────────────────────

    pub fn users(&self) -> &[User] {
        &self.users
    }

    pub fn user(&self, username: &str) -> Option<&User> {
        self.users.iter().find(|u| u.username == username)
    }

    pub fn current_user(&self) -> Option<&User> {
        let name = self.current_user.as_deref()?;
        self.users.iter().find(|u| u.username == name)
    }

    /// Select the active user; the session privilege becomes the user's
    /// maximum.
    pub fn select_user(&mut self, username: &str) -> Result<(), StoreError> {
        let user = self
            .user(username)
            .ok_or_else(|| StoreError::NotFound(username.to_string()))?;
        self.privilege = user.max_privilege;
        self.current_user = Some(username.to_string());
        tracing::info!(user = username, privilege = %self.privilege, "user selected");
        Ok(())
    }

    pub fn add_user(&mut self, user: User) -> Result<(), StoreError> {
        if self.user(&user.username).is_some() {
            return Err(StoreError::Duplicate(user.username));
        }
        self.users.push(user);
        self.persist()
    }

    pub fn remove_user(&mut self, username: &str) -> Result<(), StoreError> {
        let idx = self
            .users
            .iter()
            .position(|u| u.username == username)
            .ok_or_else(|| StoreError::NotFound(username.to_string()))?;
        if self.current_user.as_deref() == Some(username) {
            return Err(StoreError::Busy(format!(
                "cannot remove the active user {username}"
            )));
        }
        self.users.remove(idx);
        self.persist()
    }

    pub fn update_user(&mut self, user: User) -> Result<(), StoreError> {
        let existing = self
            .users
            .iter_mut()
            .find(|u| u.username == user.username)
            .ok_or_else(|| StoreError::NotFound(user.username.clone()))?;
        *existing = user;
        self.persist()
    }

    // ─── Projects ──────────────────────────────────────────────────

    pub fn projects(&self) -> &[Project] {
        &self.projects
    }

    pub fn project(&self, id: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.id == id)
    }

    pub fn current_project(&self) -> Option<&Project> {
        let id = self.current_project.as_deref()?;
        self.project(id)
    }

    pub fn select_project(&mut self, id: &str) -> Result<(), StoreError> {
        if self.project(id).is_none() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        self.current_project = Some(id.to_string());
        Ok(())
    }

    pub fn add_project(&mut self, project: Project) -> Result<(), StoreError> {
        if self.project(&project.id).is_some() {
            return Err(StoreError::Duplicate(project.id));
        }
        self.projects.push(project);
        self.persist()
    }

    pub fn remove_project(&mut self, id: &str) -> Result<(), StoreError> {
        let idx = self
            .projects
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        self.projects.remove(idx);
        if self.current_project.as_deref() == Some(id) {
            self.current_project = None;
        }
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layman(name: &str) -> User {
        User {
            username: name.to_string(),
            firstname: "Jo".to_string(),
            lastname: "Doe".to_string(),
            max_privilege: Privilege::Layman,
            email: String::new(),
            password_hash: None,
        }
    }

    #[test]
    fn fresh_session_is_superuser() {
        let acct = Accounting::in_memory();
        assert_eq!(acct.privilege(), Privilege::Superuser);
        assert!(acct.require(Privilege::ManageUsers).is_ok());
    }

    #[test]
    fn selecting_a_user_caps_the_privilege() {
        let mut acct = Accounting::in_memory();
        acct.add_user(layman("jdoe")).unwrap();
        acct.select_user("jdoe").unwrap();
        assert_eq!(acct.privilege(), Privilege::Layman);
        let err = acct.require(Privilege::Beamstop).unwrap_err();
        assert_eq!(err.required, Privilege::Beamstop);
        assert_eq!(err.held, Privilege::Layman);
    }

    #[test]
    fn privilege_can_drop_but_not_exceed_maximum() {
        let mut acct = Accounting::in_memory();
        let mut user = layman("ops");
        user.max_privilege = Privilege::ConfigureMotors;
        acct.add_user(user).unwrap();
        acct.select_user("ops").unwrap();
        acct.set_privilege(Privilege::Layman).unwrap();
        assert_eq!(acct.privilege(), Privilege::Layman);
        acct.set_privilege(Privilege::ConfigureMotors).unwrap();
        assert!(acct.set_privilege(Privilege::Superuser).is_err());
    }

    #[test]
    fn duplicate_usernames_are_rejected() {
        let mut acct = Accounting::in_memory();
        acct.add_user(layman("jdoe")).unwrap();
        assert!(matches!(
            acct.add_user(layman("jdoe")),
            Err(StoreError::Duplicate(_))
        ));
    }

    #[test]
    fn database_roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut acct = Accounting::open(dir.path(), "userdb.json").unwrap();
            let mut user = layman("jdoe");
            user.email = "jdoe@example.com".to_string();
            user.password_hash = Some("deadbeef".to_string());
            acct.add_user(user).unwrap();
            acct.add_project(Project {
                id: "MS01".to_string(),
                name: "Machine studies".to_string(),
                proposer: "J. Doe".to_string(),
            })
            .unwrap();
        }
        let acct = Accounting::open(dir.path(), "userdb.json").unwrap();
        assert_eq!(acct.users().len(), 1);
        assert_eq!(acct.users()[0].email, "jdoe@example.com");
        assert_eq!(acct.users()[0].password_hash.as_deref(), Some("deadbeef"));
        assert_eq!(acct.projects().len(), 1);
        assert_eq!(acct.projects()[0].proposer, "J. Doe");
    }
}

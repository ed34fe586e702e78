//! Account database helpers shared by collectors that walk user homes.

use crate::exec::CommandRunner;

use super::QUICK;

/// A user account from the passwd database
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct UserAccount {
    pub username: String,
    pub home: String,
    pub shell: String,
}

impl UserAccount {
    pub fn from_passwd_line(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() >= 7 && !parts[0].is_empty() {
            Some(Self {
                username: parts[0].to_string(),
                home: parts[5].to_string(),
                shell: parts[6].trim().to_string(),
            })
        } else {
            None
        }
    }

    pub fn has_login_shell(&self) -> bool {
        !self.shell.contains("nologin")
            && !self.shell.contains("false")
            && !self.shell.ends_with("/sync")
            && !self.shell.is_empty()
    }
}

/// Parse passwd-format text
pub(crate) fn parse_passwd(content: &str) -> Vec<UserAccount> {
    content.lines().filter_map(UserAccount::from_passwd_line).collect()
}

/// Accounts with an interactive shell, via `getent passwd`
pub(crate) fn login_users(runner: &dyn CommandRunner) -> Vec<UserAccount> {
    let output = runner.execute("getent passwd", QUICK);
    let text = if output.stdout.trim().is_empty() {
        runner.execute("cat /etc/passwd", QUICK).stdout
    } else {
        output.stdout
    };
    parse_passwd(&text)
        .into_iter()
        .filter(UserAccount::has_login_shell)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::ScriptedRunner;

    const PASSWD: &str = "\
root:x:0:0:root:/root:/bin/bash
daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin
sync:x:4:65534:sync:/bin:/bin/sync
alice:x:1000:1000:Alice,,,:/home/alice:/bin/zsh
svc:x:999:999::/var/lib/svc:/bin/false
broken line
";

    #[test]
    fn test_login_users_filters_shells() {
        let runner = ScriptedRunner::new().ok("getent passwd", PASSWD);
        let users: Vec<_> = login_users(&runner).into_iter().map(|u| u.username).collect();
        assert_eq!(users, vec!["root", "alice"]);
    }

    #[test]
    fn test_falls_back_to_passwd_file() {
        let runner = ScriptedRunner::new().ok("cat /etc/passwd", PASSWD);
        let users = login_users(&runner);
        assert_eq!(users.len(), 2);
        assert_eq!(users[1].home, "/home/alice");
    }
}

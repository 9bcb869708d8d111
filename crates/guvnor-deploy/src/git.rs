use std::{
    collections::HashMap,
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
    process::Stdio,
};

use futures_util::{FutureExt, future::BoxFuture};
use tokio::process::Command;

use crate::error::VcsError;
use crate::vcs::{RefKind, Vcs, VcsRef};

const MAX_ERROR_CHARS: usize = 4096;
// refname, creator date, peeled target of annotated tags, target.
const TAG_FORMAT: &str = "--format=%(refname)%09%(creatordate:unix)%09%(*objectname)%09%(objectname)";

/// [`Vcs`] driver that shells out to the `git` binary.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: PathBuf,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new("git")
    }
}

impl GitCli {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run<I, S>(&self, cwd: Option<&Path>, args: I) -> Result<String, VcsError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
        let command = format!(
            "git {}",
            args.iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        tracing::debug!(%command, "running git");
        let output = cmd.output().await.map_err(|e| VcsError::Command {
            command: command.clone(),
            message: e.to_string(),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VcsError::Command {
                command,
                message: truncate(stderr.trim(), MAX_ERROR_CHARS),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn default_branch(&self, dest: &Path) -> Result<String, VcsError> {
        match self
            .run(Some(dest), ["symbolic-ref", "--quiet", "--short", "refs/remotes/origin/HEAD"])
            .await
        {
            Ok(out) => {
                let short = out.trim();
                Ok(short.strip_prefix("origin/").unwrap_or(short).to_string())
            }
            // Clones of repositories without a remote HEAD fall back to the local branch.
            Err(_) => {
                let out = self.run(Some(dest), ["rev-parse", "--abbrev-ref", "HEAD"]).await?;
                Ok(out.trim().to_string())
            }
        }
    }

    async fn refs_under(&self, dest: &Path, prefix: &str) -> Result<Vec<String>, VcsError> {
        let out = self
            .run(Some(dest), ["for-each-ref", "--format=%(refname)", prefix.trim_end_matches('/')])
            .await?;
        Ok(out
            .lines()
            .filter_map(|line| line.trim().strip_prefix(prefix))
            .filter(|name| !name.is_empty() && *name != "HEAD")
            .map(str::to_string)
            .collect())
    }

    /// Tags oldest first. Tags created within the same second are ordered by
    /// the position of their commit in the history.
    async fn tags_oldest_first(&self, dest: &Path) -> Result<Vec<String>, VcsError> {
        let listing = self.run(Some(dest), ["for-each-ref", TAG_FORMAT, "refs/tags"]).await?;
        if listing.trim().is_empty() {
            return Ok(Vec::new());
        }
        let history = self
            .run(Some(dest), ["rev-list", "--topo-order", "--reverse", "--tags"])
            .await?;
        Ok(order_tags(&listing, &history))
    }
}

struct TagLine<'a> {
    name: &'a str,
    created: i64,
    commit: &'a str,
}

fn parse_tag_line(line: &str) -> Option<TagLine<'_>> {
    let mut fields = line.split('\t');
    let name = fields.next()?.trim().strip_prefix("refs/tags/")?;
    let created = fields.next()?.trim().parse().unwrap_or(0);
    let peeled = fields.next().unwrap_or("").trim();
    let object = fields.next().unwrap_or("").trim();
    if name.is_empty() {
        return None;
    }
    Some(TagLine {
        name,
        created,
        commit: if peeled.is_empty() { object } else { peeled },
    })
}

/// Sorts a `for-each-ref` tag listing by creator date, breaking ties with the
/// commit's index in `history` (oldest commit first).
fn order_tags(listing: &str, history: &str) -> Vec<String> {
    let rank: HashMap<&str, usize> = history
        .lines()
        .map(str::trim)
        .enumerate()
        .map(|(i, commit)| (commit, i))
        .collect();

    let mut tags: Vec<TagLine<'_>> = listing.lines().filter_map(parse_tag_line).collect();
    tags.sort_by_key(|t| (t.created, rank.get(t.commit).copied().unwrap_or(usize::MAX)));
    tags.into_iter().map(|t| t.name.to_string()).collect()
}

impl Vcs for GitCli {
    fn clone_repo<'a>(&'a self, source: &'a str, dest: &'a Path) -> BoxFuture<'a, Result<(), VcsError>> {
        async move {
            let args: [&OsStr; 4] = ["clone".as_ref(), "--quiet".as_ref(), source.as_ref(), dest.as_os_str()];
            self.run(None, args).await?;
            Ok(())
        }
        .boxed()
    }

    fn list_refs<'a>(&'a self, dest: &'a Path) -> BoxFuture<'a, Result<Vec<VcsRef>, VcsError>> {
        async move {
            let default = self.default_branch(dest).await?;
            let tags = self.tags_oldest_first(dest).await?;
            let branches = self.refs_under(dest, "refs/remotes/origin/").await?;

            let mut refs = vec![VcsRef::branch(default.clone())];
            refs.extend(tags.into_iter().map(VcsRef::tag));
            refs.extend(
                branches
                    .into_iter()
                    .filter(|b| *b != default)
                    .map(VcsRef::branch),
            );
            Ok(refs)
        }
        .boxed()
    }

    fn checkout<'a>(&'a self, dest: &'a Path, reference: &'a VcsRef) -> BoxFuture<'a, Result<(), VcsError>> {
        async move {
            let target = match reference.kind {
                RefKind::Tag => format!("refs/tags/{}", reference.name),
                RefKind::Branch => format!("refs/remotes/origin/{}", reference.name),
            };
            self.run(Some(dest), ["checkout", "--quiet", "--force", "--detach", target.as_str()])
                .await?;
            // Untracked and ignored files from the previous tree must not survive.
            self.run(Some(dest), ["clean", "-ffdxq"]).await?;
            Ok(())
        }
        .boxed()
    }

    fn fetch_refs<'a>(&'a self, dest: &'a Path) -> BoxFuture<'a, Result<(), VcsError>> {
        async move {
            self.run(Some(dest), ["fetch", "--quiet", "--tags", "--force", "--prune", "origin"])
                .await?;
            Ok(())
        }
        .boxed()
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_short_messages() {
        assert_eq!(truncate("fatal: nope", 64), "fatal: nope");
        assert_eq!(truncate("abcdef", 3), "abc…");
    }

    #[test]
    fn same_second_tags_follow_history() {
        let listing = "refs/tags/v10\t1700000000\t\tc2\n\
                       refs/tags/v11\t1700000000\t\tc3\n\
                       refs/tags/v9\t1700000000\t\tc1\n\
                       refs/tags/v1\t1600000000\tc0\ttagobj\n";
        let history = "c0\nc1\nc2\nc3\n";

        assert_eq!(order_tags(listing, history), vec!["v1", "v9", "v10", "v11"]);
    }

    #[test]
    fn creator_date_wins_over_history() {
        let listing = "refs/tags/late\t1700000060\t\tc1\n\
                       refs/tags/early\t1700000000\t\tc2\n";

        assert_eq!(order_tags(listing, "c1\nc2\n"), vec!["early", "late"]);
    }

    #[tokio::test]
    async fn missing_binary_is_a_command_error() {
        let git = GitCli::new("/nonexistent/guvnor-git");
        let dir = tempfile::tempdir().unwrap();
        let err = git.list_refs(dir.path()).await.unwrap_err();
        assert!(matches!(err, VcsError::Command { .. }));
    }
}

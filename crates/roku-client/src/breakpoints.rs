//! Breakpoint records and their dual-identity registry.
//!
//! Every breakpoint the user creates gets a *local* id (assigned here,
//! shown in the CLI) and, once installed, a *remote* id assigned by the
//! target. The manager reconciles the two: responses from the target are
//! folded back in by remote id when available, by (uri, line) otherwise.

/// A source breakpoint tracked by this client.
///
/// `file_uri` carries a scheme (`pkg:/` or `lib:/<name>/`); any mangling
/// for targets that want bare paths happens in the request encoder, never
/// in the stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    pub file_uri: String,
    pub line_number: u32,
    /// Stops to skip before actually breaking.
    pub ignore_count: u32,
    /// Condition expression; `None` means unconditional.
    pub cond_expr: Option<String>,
    /// Id shown to the user; assigned by the manager, never reused.
    pub local_id: Option<u32>,
    /// Id assigned by the target; 0/None means not installed.
    pub remote_id: Option<u32>,
    pub verified: bool,
}

impl Breakpoint {
    pub fn new(file_uri: impl Into<String>, line_number: u32) -> Self {
        Self {
            file_uri: file_uri.into(),
            line_number,
            ignore_count: 0,
            cond_expr: None,
            local_id: None,
            remote_id: None,
            verified: false,
        }
    }

    pub fn with_ignore_count(mut self, ignore_count: u32) -> Self {
        self.ignore_count = ignore_count;
        self
    }

    pub fn with_condition(mut self, cond_expr: impl Into<String>) -> Self {
        let cond = cond_expr.into();
        // An empty condition means no condition.
        self.cond_expr = if cond.is_empty() { None } else { Some(cond) };
        self
    }

    /// Installed on the target.
    pub fn is_on_target(&self) -> bool {
        matches!(self.remote_id, Some(id) if id != 0)
    }
}

/// Registry of user breakpoints, accessed from the front-end task only.
#[derive(Debug)]
pub struct BreakpointManager {
    breakpoints: Vec<Breakpoint>,
    // 0 is invalid; local ids start at 1000
    next_local_id: u32,
}

impl Default for BreakpointManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakpointManager {
    pub fn new() -> Self {
        Self { breakpoints: Vec::new(), next_local_id: 1000 }
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }

    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.iter()
    }

    /// Fold a breakpoint into the registry: match by remote id when set,
    /// else by (uri, line); update the match or append a new record.
    /// Newcomers get the next local id. Returns the stored record.
    pub fn add_or_update(&mut self, breakpoint: Breakpoint) -> &Breakpoint {
        let existing = match breakpoint.remote_id {
            Some(remote_id) if remote_id != 0 => self
                .breakpoints
                .iter()
                .position(|b| b.remote_id == Some(remote_id))
                .or_else(|| self.position_by_spec(&breakpoint.file_uri, breakpoint.line_number)),
            _ => self.position_by_spec(&breakpoint.file_uri, breakpoint.line_number),
        };

        let index = match existing {
            Some(index) => {
                let managed = &mut self.breakpoints[index];
                managed.ignore_count = breakpoint.ignore_count;
                managed.remote_id = breakpoint.remote_id;
                managed.verified = breakpoint.verified;
                if breakpoint.cond_expr.is_some() {
                    managed.cond_expr = breakpoint.cond_expr;
                }
                index
            }
            None => {
                self.breakpoints.push(breakpoint);
                self.breakpoints.len() - 1
            }
        };
        self.assign_local_ids();
        &self.breakpoints[index]
    }

    pub fn remove_by_local_id(&mut self, local_id: u32) -> Option<Breakpoint> {
        let index = self.breakpoints.iter().position(|b| b.local_id == Some(local_id))?;
        Some(self.breakpoints.remove(index))
    }

    pub fn find_by_local_id(&self, local_id: u32) -> Option<&Breakpoint> {
        self.breakpoints.iter().find(|b| b.local_id == Some(local_id))
    }

    pub fn find_by_local_id_mut(&mut self, local_id: u32) -> Option<&mut Breakpoint> {
        self.breakpoints.iter_mut().find(|b| b.local_id == Some(local_id))
    }

    pub fn find_by_remote_id(&self, remote_id: u32) -> Option<&Breakpoint> {
        if remote_id == 0 {
            return None;
        }
        self.breakpoints.iter().find(|b| b.remote_id == Some(remote_id))
    }

    /// Exact (uri, line) match.
    pub fn find_by_spec(&self, file_uri: &str, line_number: u32) -> Option<&Breakpoint> {
        self.position_by_spec(file_uri, line_number).map(|i| &self.breakpoints[i])
    }

    /// Match a breakpoint whose uri is a suffix of `file_path` (the
    /// target reports full paths, users register `pkg:/`-relative ones).
    pub fn find_at_line(&self, file_path: &str, line_number: u32) -> Option<&Breakpoint> {
        self.breakpoints
            .iter()
            .find(|b| b.line_number == line_number && file_path.ends_with(&b.file_uri))
    }

    fn position_by_spec(&self, file_uri: &str, line_number: u32) -> Option<usize> {
        self.breakpoints
            .iter()
            .position(|b| b.file_uri == file_uri && b.line_number == line_number)
    }

    fn assign_local_ids(&mut self) {
        for breakpoint in &mut self.breakpoints {
            if breakpoint.local_id.is_none() {
                breakpoint.local_id = Some(self.next_local_id);
                self.next_local_id += 1;
            }
        }
    }
}

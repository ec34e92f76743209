//! Task graph model over the plain-text board.
//!
//! The board is a markdown-like file of `## group` headers followed by task
//! lines. Position inside a group is the only dependency: a blocked task may
//! start once every earlier task of its group is done.
//!
//! ```text
//! ## api
//! - [x] <a1b2c3d4> <9f3e2c1> add login route
//! - [~] <b5c6d7e8> add logout route {model:haiku}
//! - [-] document auth routes
//! ```

use crate::domain::models::{ExecutionId, Group, Task, TaskStatus, TaskTag};

/// Group that receives task lines appearing before any header.
pub const DEFAULT_GROUP: &str = "default";

/// Separator between a failed task's description and its reason.
const REASON_SEPARATOR: &str = " // ";

/// Classified line of the board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardLine {
    Header(String),
    Task(Task),
    /// Anything else; preserved untouched
    Other,
}

/// A task together with where it sits in the board text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedTask {
    /// Zero-based line index in the board text
    pub line_index: usize,
    pub group: String,
    pub task: Task,
}

/// Strip the line terminator (`\n` or `\r\n`) from a raw line.
pub fn trim_line_ending(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

/// Classify a single line without its terminator.
pub fn classify_line(line: &str) -> BoardLine {
    let trimmed = line.trim();
    if let Some(rest) = trimmed.strip_prefix("##") {
        if !rest.starts_with('#') && (rest.is_empty() || rest.starts_with(char::is_whitespace)) {
            let name = rest.trim();
            return if name.is_empty() {
                BoardLine::Other
            } else {
                BoardLine::Header(name.to_string())
            };
        }
    }
    parse_task_line(line).map_or(BoardLine::Other, BoardLine::Task)
}

/// Parse one task line; `None` when the line is not a task.
pub fn parse_task_line(line: &str) -> Option<Task> {
    let trimmed = line.trim();
    let rest = trimmed
        .strip_prefix("- ")
        .or_else(|| trimmed.strip_prefix("* "))?;
    let rest = rest.strip_prefix('[')?;
    let mut chars = rest.chars();
    let status = TaskStatus::from_marker(chars.next()?)?;
    let mut rest = chars.as_str().strip_prefix(']')?.trim_start();

    // Only the statuses that carry metadata consume leading `<token>`s.
    let wanted = match status {
        TaskStatus::Done => 2,
        TaskStatus::InProgress | TaskStatus::Failed => 1,
        TaskStatus::Pending | TaskStatus::Blocked => 0,
    };
    let mut tokens: Vec<&str> = Vec::with_capacity(wanted);
    while tokens.len() < wanted {
        let Some(after) = rest.strip_prefix('<') else {
            break;
        };
        let Some(end) = after.find('>') else {
            break;
        };
        let token = &after[..end];
        if token.is_empty() || token.contains(char::is_whitespace) {
            break;
        }
        tokens.push(token);
        rest = after[end + 1..].trim_start();
    }

    let (body, error) = if status == TaskStatus::Failed {
        // Reasons never contain the separator, descriptions may.
        match rest.rsplit_once(REASON_SEPARATOR) {
            Some((body, reason)) => (body, Some(reason.trim().to_string())),
            None => (rest, None),
        }
    } else {
        (rest, None)
    };

    let (description, tags) = split_tags(body.trim());
    if description.is_empty() {
        return None;
    }

    let mut task = Task::new(description).with_status(status);
    task.tags = tags;
    task.execution_id = tokens.first().and_then(|t| ExecutionId::parse(t));
    task.result_ref = tokens.get(1).map(|t| (*t).to_string());
    task.error = error.filter(|e| !e.is_empty());
    Some(task)
}

fn split_tags(body: &str) -> (String, Vec<TaskTag>) {
    if body.ends_with('}') {
        if let Some(open) = body.rfind('{') {
            let description = body[..open].trim();
            if !description.is_empty() {
                let tags = body[open + 1..body.len() - 1]
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(TaskTag::parse)
                    .collect();
                return (description.to_string(), tags);
            }
        }
    }
    (body.to_string(), Vec::new())
}

/// Render one task line without a terminator.
pub fn render_task_line(task: &Task) -> String {
    let mut line = format!("- [{}]", task.status.marker());
    let carries_id = matches!(
        task.status,
        TaskStatus::InProgress | TaskStatus::Done | TaskStatus::Failed
    );
    if carries_id {
        if let Some(id) = &task.execution_id {
            line.push_str(&format!(" <{id}>"));
            if task.status == TaskStatus::Done {
                if let Some(result_ref) = &task.result_ref {
                    line.push_str(&format!(" <{result_ref}>"));
                }
            }
        }
    }
    line.push(' ');
    line.push_str(&task.description);
    if !task.tags.is_empty() {
        let tags: Vec<String> = task.tags.iter().map(TaskTag::render).collect();
        line.push_str(&format!(" {{{}}}", tags.join(", ")));
    }
    if task.status == TaskStatus::Failed {
        if let Some(error) = &task.error {
            line.push_str(REASON_SEPARATOR);
            line.push_str(error);
        }
    }
    line
}

/// Walk the board, yielding every task with its group and line index.
pub fn scan(text: &str) -> Vec<LocatedTask> {
    let mut group = DEFAULT_GROUP.to_string();
    let mut located = Vec::new();
    for (line_index, raw) in text.split_inclusive('\n').enumerate() {
        match classify_line(trim_line_ending(raw)) {
            BoardLine::Header(name) => group = name,
            BoardLine::Task(task) => located.push(LocatedTask {
                line_index,
                group: group.clone(),
                task,
            }),
            BoardLine::Other => {}
        }
    }
    located
}

/// Parse the board into groups in declaration order.
///
/// Repeated headers continue the earlier group. Groups without tasks are
/// dropped.
pub fn parse(text: &str) -> Vec<Group> {
    let mut groups: Vec<Group> = Vec::new();
    for located in scan(text) {
        let index = match groups.iter().position(|g| g.name == located.group) {
            Some(index) => index,
            None => {
                groups.push(Group::new(located.group.clone()));
                groups.len() - 1
            }
        };
        groups[index].push(located.task);
    }
    groups
}

/// Render groups back into board text.
pub fn render(groups: &[Group]) -> String {
    let mut out = String::new();
    for group in groups.iter().filter(|g| !g.tasks.is_empty()) {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&format!("## {}\n", group.name));
        for task in &group.tasks {
            out.push_str(&render_task_line(task));
            out.push('\n');
        }
    }
    out
}

/// Tasks that may start now, grouped in declaration order.
///
/// Pending tasks always qualify; blocked tasks qualify once everything
/// before them in the group is done. A failed task keeps its successors
/// blocked.
pub fn eligible(groups: &[Group]) -> Vec<(String, Vec<Task>)> {
    groups
        .iter()
        .filter_map(|group| {
            let mut predecessors_done = true;
            let mut ready = Vec::new();
            for task in &group.tasks {
                match task.status {
                    TaskStatus::Pending => ready.push(task.clone()),
                    TaskStatus::Blocked if predecessors_done => ready.push(task.clone()),
                    _ => {}
                }
                if task.status != TaskStatus::Done {
                    predecessors_done = false;
                }
            }
            (!ready.is_empty()).then(|| (group.name.clone(), ready))
        })
        .collect()
}

/// Cheap textual check for pending or blocked lines.
pub fn has_pending_work(text: &str) -> bool {
    text.lines().any(|line| {
        let line = line.trim_start();
        ["- [ ]", "- [-]", "* [ ]", "* [-]"]
            .iter()
            .any(|prefix| line.starts_with(prefix))
    })
}

/// First task whose description equals `key`.
pub fn locate(text: &str, key: &str) -> Option<LocatedTask> {
    scan(text)
        .into_iter()
        .find(|located| located.task.description == key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{TaskPriority, TransitionMeta};

    const BOARD: &str = "\
# Sprint board

## A
- [x] <a1b2c3d4> <9f3e2c1> build x
- [-] test x

## B
- [~] <b5c6d7e8> refactor y {model:haiku, priority:high}
- [-] document y
- [!] <c0ffee00> flaky thing // tests timed out

some trailing prose
";

    #[test]
    fn test_parse_groups_and_statuses() {
        let groups = parse(BOARD);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].name, "A");
        assert_eq!(groups[0].tasks.len(), 2);

        let done = &groups[0].tasks[0];
        assert_eq!(done.status, TaskStatus::Done);
        assert_eq!(done.execution_id.as_ref().map(ExecutionId::as_str), Some("a1b2c3d4"));
        assert_eq!(done.result_ref.as_deref(), Some("9f3e2c1"));
        assert_eq!(done.description, "build x");

        let running = &groups[1].tasks[0];
        assert_eq!(running.status, TaskStatus::InProgress);
        assert_eq!(running.model_hint(), Some("haiku"));
        assert_eq!(running.priority(), TaskPriority::High);
        assert_eq!(running.position, 0);

        let failed = &groups[1].tasks[2];
        assert_eq!(failed.error.as_deref(), Some("tests timed out"));
        assert_eq!(failed.position, 2);
    }

    #[test]
    fn test_tasks_before_header_use_default_group() {
        let groups = parse("- [ ] orphan\n## Named\n- [ ] child\n");
        assert_eq!(groups[0].name, DEFAULT_GROUP);
        assert_eq!(groups[0].tasks[0].description, "orphan");
        assert_eq!(groups[1].name, "Named");
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let groups = parse("## A\n- [?] weird\n- [ ]\n- plain bullet\n-[ ] nospace\n- [ ] real\n");
        assert_eq!(groups[0].tasks.len(), 1);
        assert_eq!(groups[0].tasks[0].description, "real");
    }

    #[test]
    fn test_empty_groups_produce_nothing() {
        let groups = parse("## Empty\n\n## Full\n- [ ] one\n");
        assert_eq!(groups.len(), 1);
        assert!(eligible(&parse("## Empty\n")).is_empty());
    }

    #[test]
    fn test_repeated_header_continues_group() {
        let groups = parse("## A\n- [ ] one\n## B\n- [ ] two\n## A\n- [-] three\n");
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].tasks.len(), 2);
        assert_eq!(groups[0].tasks[1].position, 1);
    }

    #[test]
    fn test_blocked_waits_for_predecessors() {
        let groups = parse("## A\n- [ ] build x\n- [-] test x\n");
        let ready = eligible(&groups);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].1.len(), 1);
        assert_eq!(ready[0].1[0].description, "build x");

        let groups = parse("## A\n- [x] <a1b2c3d4> <abc> build x\n- [-] test x\n");
        let ready = eligible(&groups);
        assert_eq!(ready[0].1[0].description, "test x");
    }

    #[test]
    fn test_failed_task_never_unblocks() {
        let groups = parse("## A\n- [!] <a1b2c3d4> build x // boom\n- [-] test x\n");
        assert!(eligible(&groups).is_empty());
    }

    #[test]
    fn test_pending_is_eligible_behind_unfinished_work() {
        let groups = parse("## A\n- [~] <a1b2c3d4> first\n- [ ] second\n- [-] third\n");
        let ready = eligible(&groups);
        let names: Vec<&str> = ready[0].1.iter().map(|t| t.description.as_str()).collect();
        assert_eq!(names, vec!["second"]);
    }

    #[test]
    fn test_eligible_keeps_group_order() {
        let groups = parse("## Z\n- [ ] z1\n## A\n- [ ] a1\n");
        let ready = eligible(&groups);
        assert_eq!(ready[0].0, "Z");
        assert_eq!(ready[1].0, "A");
    }

    #[test]
    fn test_render_round_trip() {
        let groups = parse(BOARD);
        let rendered = render(&groups);
        assert_eq!(parse(&rendered), groups);
    }

    #[test]
    fn test_render_task_line_shapes() {
        let line = "- [x] <a1b2c3d4> <9f3e2c1> build x {workspace:shared}";
        let task = parse_task_line(line).unwrap();
        assert_eq!(render_task_line(&task), line);

        let line = "- [!] <a1b2c3d4> build x // no space left";
        assert_eq!(render_task_line(&parse_task_line(line).unwrap()), line);
    }

    #[test]
    fn test_open_lines_keep_angle_bracket_text() {
        let task = parse_task_line("- [ ] <div> wrapper fix").unwrap();
        assert_eq!(task.description, "<div> wrapper fix");
        assert!(task.execution_id.is_none());
        assert_eq!(render_task_line(&task), "- [ ] <div> wrapper fix");

        let task = parse_task_line("- [-] <a> <b> link styles").unwrap();
        assert_eq!(task.description, "<a> <b> link styles");
        assert!(task.result_ref.is_none());

        // A running line takes the id and leaves the rest of the text alone.
        let task = parse_task_line("- [~] <a1b2c3d4> <div> wrapper fix").unwrap();
        assert_eq!(task.execution_id.as_ref().map(ExecutionId::as_str), Some("a1b2c3d4"));
        assert_eq!(task.description, "<div> wrapper fix");
    }

    #[test]
    fn test_failed_reason_split_at_last_separator() {
        let task = parse_task_line("- [!] <a1b2c3d4> port a // b helper // boom").unwrap();
        assert_eq!(task.description, "port a // b helper");
        assert_eq!(task.error.as_deref(), Some("boom"));

        let mut task = Task::new("port a // b helper");
        task.apply_transition(
            TaskStatus::Failed,
            &TransitionMeta::failed(ExecutionId::parse("a1b2c3d4"), "verify: see a // b"),
        );
        let reparsed = parse_task_line(&render_task_line(&task)).unwrap();
        assert_eq!(reparsed.description, "port a // b helper");
        assert_eq!(reparsed.error.as_deref(), Some("verify: see a / b"));
    }

    #[test]
    fn test_unknown_tags_preserved() {
        let task = parse_task_line("- [ ] build {flaky, model:opus}").unwrap();
        assert_eq!(task.tags[0], TaskTag::Other("flaky".to_string()));
        assert_eq!(render_task_line(&task), "- [ ] build {flaky, model:opus}");
    }

    #[test]
    fn test_has_pending_work() {
        assert!(has_pending_work("## A\n  - [ ] x\n"));
        assert!(has_pending_work("## A\n- [-] x\n"));
        assert!(!has_pending_work("## A\n- [x] <a> <b> x\n- [~] <c> y\n"));
    }

    #[test]
    fn test_locate_first_match_wins() {
        let text = "## A\n- [ ] dup\n## B\n- [ ] dup\n";
        let located = locate(text, "dup").unwrap();
        assert_eq!(located.line_index, 1);
        assert_eq!(located.group, "A");
        assert!(locate(text, "missing").is_none());
    }

    #[test]
    fn test_crlf_lines_are_classified() {
        let located = locate("## A\r\n- [ ] build\r\n", "build").unwrap();
        assert_eq!(located.line_index, 1);
    }
}

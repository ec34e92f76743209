use drover::domain::models::{ExecutionId, Group, Task, TaskStatus, TaskTag};
use drover::services::task_graph;
use proptest::prelude::*;

fn status_strategy() -> impl Strategy<Value = TaskStatus> {
    prop_oneof![
        Just(TaskStatus::Pending),
        Just(TaskStatus::Blocked),
        Just(TaskStatus::InProgress),
        Just(TaskStatus::Done),
        Just(TaskStatus::Failed),
    ]
}

fn tag_strategy() -> impl Strategy<Value = Option<TaskTag>> {
    prop_oneof![
        Just(None),
        Just(Some(TaskTag::Model("haiku".to_string()))),
        Just(Some(TaskTag::Workspace("shared".to_string()))),
        Just(Some(TaskTag::Other("needs-review".to_string()))),
    ]
}

/// A task whose metadata is consistent with its status.
fn build_task(description: String, status: TaskStatus, tag: Option<TaskTag>, n: usize) -> Task {
    let mut task = Task::new(description).with_status(status);
    if let Some(tag) = tag {
        task.tags.push(tag);
    }
    if matches!(
        status,
        TaskStatus::InProgress | TaskStatus::Done | TaskStatus::Failed
    ) {
        task.execution_id = ExecutionId::parse(&format!("{n:08x}"));
    }
    if status == TaskStatus::Done {
        task.result_ref = Some(format!("{:07x}", n * 7919));
    }
    if status == TaskStatus::Failed {
        task.error = Some(format!("attempt {n} failed"));
    }
    task
}

fn board_strategy() -> impl Strategy<Value = Vec<Group>> {
    prop::collection::vec(
        prop::collection::vec(
            ("[a-z]{1,8}( [a-z]{1,8}){0,2}", status_strategy(), tag_strategy()),
            1..6,
        ),
        1..4,
    )
    .prop_map(|groups| {
        let mut n = 0usize;
        groups
            .into_iter()
            .enumerate()
            .map(|(g, tasks)| {
                let mut group = Group::new(format!("group {g}"));
                for (words, status, tag) in tasks {
                    n += 1;
                    // Descriptions are the board's natural key, keep them unique.
                    group.push(build_task(format!("{words} {n}"), status, tag, n));
                }
                group
            })
            .collect()
    })
}

proptest! {
    /// Property: rendering then parsing a board gives the same groups back
    #[test]
    fn prop_render_parse_round_trip(groups in board_strategy()) {
        let text = task_graph::render(&groups);
        let parsed = task_graph::parse(&text);
        prop_assert_eq!(parsed, groups);
    }

    /// Property: a task is eligible exactly when it is pending, or blocked
    /// behind predecessors that are all done
    #[test]
    fn prop_eligibility_follows_position(groups in board_strategy()) {
        let eligible = task_graph::eligible(&groups);

        for group in &groups {
            let ready: Vec<&str> = eligible
                .iter()
                .find(|(name, _)| *name == group.name)
                .map(|(_, tasks)| tasks.iter().map(Task::key).collect())
                .unwrap_or_default();

            for (i, task) in group.tasks.iter().enumerate() {
                let predecessors_done = group.tasks[..i]
                    .iter()
                    .all(|t| t.status == TaskStatus::Done);
                let expected = match task.status {
                    TaskStatus::Pending => true,
                    TaskStatus::Blocked => predecessors_done,
                    _ => false,
                };
                prop_assert_eq!(
                    ready.contains(&task.key()),
                    expected,
                    "task {:?} with status {}",
                    task.key(),
                    task.status
                );
            }
        }
    }

    /// Property: the cheap textual check agrees with the parsed board
    #[test]
    fn prop_pending_check_matches_parse(groups in board_strategy()) {
        let text = task_graph::render(&groups);
        let has_open = groups
            .iter()
            .flat_map(|g| &g.tasks)
            .any(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Blocked));
        prop_assert_eq!(task_graph::has_pending_work(&text), has_open);
    }

    /// Property: patching one task's status leaves every other line untouched
    #[test]
    fn prop_single_line_patch(groups in board_strategy(), pick in any::<prop::sample::Index>()) {
        let text = task_graph::render(&groups);
        let located = task_graph::scan(&text);
        let target = &located[pick.index(located.len())];

        let mut task = target.task.clone();
        task.status = TaskStatus::Blocked;
        task.execution_id = None;
        task.result_ref = None;
        task.error = None;
        let line = task_graph::render_task_line(&task);

        let patched: Vec<String> = text
            .lines()
            .enumerate()
            .map(|(i, l)| if i == target.line_index { line.clone() } else { l.to_string() })
            .collect();
        let reparsed = task_graph::scan(&(patched.join("\n") + "\n"));

        prop_assert_eq!(reparsed.len(), located.len());
        for (before, after) in located.iter().zip(&reparsed) {
            if before.line_index == target.line_index {
                prop_assert_eq!(after.task.status, TaskStatus::Blocked);
            } else {
                prop_assert_eq!(&after.task, &before.task);
            }
        }
    }
}

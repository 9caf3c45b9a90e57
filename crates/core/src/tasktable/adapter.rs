//! Validated, flattened view of a task table.

use std::collections::{BTreeMap, HashSet};

use crate::job::ResolvedInput;

use super::{Alternative, Input, Origin, ProductMode, Task, TaskTable, TaskTableError};

/// An input with its logical reference name and owning task.
#[derive(Debug, Clone)]
pub struct AdaptedInput {
    pub reference: String,
    pub task: String,
    pub input: Input,
}

impl AdaptedInput {
    /// Alternatives sorted by ascending order, declaration order kept on ties.
    pub fn sorted_alternatives(&self) -> Vec<&Alternative> {
        let mut alts: Vec<&Alternative> = self.input.alternatives.iter().collect();
        alts.sort_by_key(|a| a.effective_order());
        alts
    }
}

/// Task table checked at load time. Structural errors never reach job processing.
#[derive(Debug, Clone)]
pub struct TaskTableAdapter {
    name: String,
    table: TaskTable,
    inputs: Vec<AdaptedInput>,
}

impl TaskTableAdapter {
    pub fn new(name: impl Into<String>, table: TaskTable) -> Result<Self, TaskTableError> {
        let name = name.into();
        let mut inputs = Vec::new();
        let mut seen = HashSet::new();

        for task in table.tasks() {
            for (idx, input) in task.inputs.iter().enumerate() {
                let reference = match &input.id {
                    Some(id) if !id.is_empty() => id.clone(),
                    _ => format!("{}:{}", task.name, idx),
                };
                if !seen.insert(reference.clone()) {
                    return Err(TaskTableError::Invalid {
                        table: name,
                        reason: format!("duplicate input reference {}", reference),
                    });
                }
                inputs.push(AdaptedInput {
                    reference,
                    task: task.name.clone(),
                    input: input.clone(),
                });
            }
        }

        Self::check_references(&name, &inputs)?;

        Ok(Self {
            name,
            table,
            inputs,
        })
    }

    fn check_references(name: &str, inputs: &[AdaptedInput]) -> Result<(), TaskTableError> {
        let by_id: BTreeMap<&str, &AdaptedInput> = inputs
            .iter()
            .filter_map(|i| i.input.id.as_deref().map(|id| (id, i)))
            .collect();

        for adapted in inputs {
            match adapted.input.reference.as_deref().filter(|r| !r.is_empty()) {
                Some(target) => {
                    let Some(referred) = by_id.get(target) else {
                        return Err(TaskTableError::Invalid {
                            table: name.to_string(),
                            reason: format!(
                                "input {} references unknown input {}",
                                adapted.reference, target
                            ),
                        });
                    };
                    // Single level only: a referred input must own alternatives.
                    if referred.input.reference.is_some() || target == adapted.reference {
                        return Err(TaskTableError::Invalid {
                            table: name.to_string(),
                            reason: format!(
                                "input {} references {} which is itself a reference",
                                adapted.reference, target
                            ),
                        });
                    }
                }
                None => {
                    if adapted.input.alternatives.is_empty() {
                        return Err(TaskTableError::Invalid {
                            table: name.to_string(),
                            reason: format!("input {} has no alternative", adapted.reference),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &TaskTable {
        &self.table
    }

    pub fn processor_name(&self) -> &str {
        &self.table.processor_name
    }

    pub fn version(&self) -> &str {
        &self.table.version
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.table.tasks()
    }

    /// Inputs in declaration order.
    pub fn inputs(&self) -> &[AdaptedInput] {
        &self.inputs
    }

    pub fn input(&self, reference: &str) -> Option<&AdaptedInput> {
        self.inputs.iter().find(|i| i.reference == reference)
    }

    /// Inputs applicable to the product mode.
    pub fn inputs_for(&self, mode: ProductMode) -> impl Iterator<Item = &AdaptedInput> {
        self.inputs
            .iter()
            .filter(move |i| mode.is_compatible_with(i.input.mode))
    }

    /// Searchable alternatives of applicable, non-reference inputs.
    pub fn db_alternatives(&self, mode: ProductMode) -> impl Iterator<Item = &Alternative> {
        self.inputs_for(mode)
            .filter(|i| i.input.reference.is_none())
            .flat_map(|i| i.input.alternatives.iter())
            .filter(|a| a.origin == Origin::Db)
    }

    /// Pending placeholders for every applicable input.
    pub fn initial_inputs(&self, mode: ProductMode) -> Vec<ResolvedInput> {
        self.inputs_for(mode)
            .map(|i| ResolvedInput::pending(i.reference.clone(), i.input.mandatory))
            .collect()
    }

    /// References of the inputs declared by a task.
    pub fn references_of_task<'a>(&'a self, task: &'a str) -> impl Iterator<Item = &'a str> {
        self.inputs
            .iter()
            .filter(move |i| i.task == task)
            .map(|i| i.reference.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasktable::{FileNameType, InputMode, Pool};

    fn alt(file_type: &str, order: Option<u32>) -> Alternative {
        Alternative {
            order,
            origin: Origin::Db,
            retrieval_mode: "ValCover".to_string(),
            delta_time0: 0.0,
            delta_time1: 0.0,
            file_type: file_type.to_string(),
            file_name_type: FileNameType::Physical,
        }
    }

    fn input(id: Option<&str>, reference: Option<&str>, alternatives: Vec<Alternative>) -> Input {
        Input {
            id: id.map(String::from),
            reference: reference.map(String::from),
            mode: InputMode::Always,
            mandatory: true,
            alternatives,
        }
    }

    fn table(inputs: Vec<Input>) -> TaskTable {
        TaskTable {
            processor_name: "L0_ASP".to_string(),
            version: "3.40".to_string(),
            pools: vec![Pool {
                tasks: vec![Task {
                    name: "AspTask".to_string(),
                    version: "3.40".to_string(),
                    binary_path: "/usr/local/bin/asp".to_string(),
                    inputs,
                    outputs: vec![],
                }],
            }],
        }
    }

    #[test]
    fn test_logical_names() {
        let adapter = TaskTableAdapter::new(
            "TaskTable.L0ASP.xml",
            table(vec![
                input(Some("cal"), None, vec![alt("AUX_CAL", None)]),
                input(None, None, vec![alt("AUX_INS", None)]),
            ]),
        )
        .unwrap();

        let names: Vec<_> = adapter.inputs().iter().map(|i| i.reference.as_str()).collect();
        assert_eq!(names, vec!["cal", "AspTask:1"]);
    }

    #[test]
    fn test_unknown_reference_rejected() {
        let result = TaskTableAdapter::new(
            "tt",
            table(vec![input(None, Some("missing"), vec![])]),
        );
        assert!(matches!(result, Err(TaskTableError::Invalid { .. })));
    }

    #[test]
    fn test_chained_reference_rejected() {
        let result = TaskTableAdapter::new(
            "tt",
            table(vec![
                input(Some("a"), None, vec![alt("AUX_CAL", None)]),
                input(Some("b"), Some("a"), vec![]),
                input(Some("c"), Some("b"), vec![]),
            ]),
        );
        assert!(matches!(result, Err(TaskTableError::Invalid { .. })));
    }

    #[test]
    fn test_self_reference_rejected() {
        let result = TaskTableAdapter::new("tt", table(vec![input(Some("a"), Some("a"), vec![])]));
        assert!(result.is_err());
    }

    #[test]
    fn test_input_without_alternative_rejected() {
        let result = TaskTableAdapter::new("tt", table(vec![input(Some("a"), None, vec![])]));
        assert!(result.is_err());
    }

    #[test]
    fn test_forward_reference_accepted() {
        let adapter = TaskTableAdapter::new(
            "tt",
            table(vec![
                input(Some("b"), Some("a"), vec![]),
                input(Some("a"), None, vec![alt("AUX_CAL", None)]),
            ]),
        )
        .unwrap();
        assert_eq!(adapter.initial_inputs(ProductMode::NonSlicing).len(), 2);
        assert_eq!(adapter.db_alternatives(ProductMode::NonSlicing).count(), 1);
    }

    #[test]
    fn test_sorted_alternatives() {
        let adapter = TaskTableAdapter::new(
            "tt",
            table(vec![input(
                Some("a"),
                None,
                vec![alt("X", Some(2)), alt("Y", Some(1)), alt("Z", None)],
            )]),
        )
        .unwrap();
        let order: Vec<_> = adapter.inputs()[0]
            .sorted_alternatives()
            .iter()
            .map(|a| a.file_type.as_str())
            .collect();
        assert_eq!(order, vec!["Y", "X", "Z"]);
    }

    #[test]
    fn test_mode_filtering() {
        let mut slicing_only = input(Some("s"), None, vec![alt("AUX_S", None)]);
        slicing_only.mode = InputMode::Slicing;
        let adapter = TaskTableAdapter::new(
            "tt",
            table(vec![slicing_only, input(Some("a"), None, vec![alt("AUX_A", None)])]),
        )
        .unwrap();

        assert_eq!(adapter.inputs_for(ProductMode::NonSlicing).count(), 1);
        assert_eq!(adapter.inputs_for(ProductMode::Slicing).count(), 2);
    }
}

//! Array submission batches.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::Value;

/// The unit of array submission: instances sharing (array, batch number,
/// resource request), produced by `instantiate_task_instances`.
#[derive(Debug, Clone)]
pub struct TaskInstanceBatch {
    pub array_id: i64,
    pub array_name: String,
    pub batch_number: i64,
    pub task_resources_id: i64,
    pub task_instance_ids: BTreeSet<i64>,

    /// Loaded lazily from the server before submission.
    pub requested_resources: Option<BTreeMap<String, Value>>,
}

impl TaskInstanceBatch {
    pub fn new(
        array_id: i64,
        array_name: String,
        batch_number: i64,
        task_resources_id: i64,
    ) -> Self {
        Self {
            array_id,
            array_name,
            batch_number,
            task_resources_id,
            task_instance_ids: BTreeSet::new(),
            requested_resources: None,
        }
    }

    pub fn add_task_instance(&mut self, task_instance_id: i64) {
        self.task_instance_ids.insert(task_instance_id);
    }

    /// The cluster-facing job name.
    pub fn submission_name(&self) -> String {
        format!("{}-{}", self.array_name, self.batch_number)
    }

    /// Map the cluster's `array_step_id -> distributor_id` response onto
    /// task instance ids. Step ids are 0-based in submission order, which
    /// is ascending instance id within the batch.
    pub fn distributor_ids_by_instance(
        &self,
        distributor_id_map: &HashMap<i64, String>,
    ) -> HashMap<i64, String> {
        self.task_instance_ids
            .iter()
            .enumerate()
            .filter_map(|(step_id, task_instance_id)| {
                distributor_id_map
                    .get(&(step_id as i64))
                    .map(|distributor_id| (*task_instance_id, distributor_id.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_ids_map_onto_sorted_instance_ids() {
        let mut batch = TaskInstanceBatch::new(7, "arr".to_string(), 2, 11);
        batch.add_task_instance(103);
        batch.add_task_instance(101);
        batch.add_task_instance(102);

        let cluster_response = HashMap::from([
            (0, "job-7_0".to_string()),
            (1, "job-7_1".to_string()),
            (2, "job-7_2".to_string()),
        ]);
        let by_instance = batch.distributor_ids_by_instance(&cluster_response);
        assert_eq!(by_instance[&101], "job-7_0");
        assert_eq!(by_instance[&102], "job-7_1");
        assert_eq!(by_instance[&103], "job-7_2");
    }

    #[test]
    fn submission_name_includes_the_batch_number() {
        let batch = TaskInstanceBatch::new(7, "fit-models".to_string(), 3, 11);
        assert_eq!(batch.submission_name(), "fit-models-3");
    }
}

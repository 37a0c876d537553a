use fleet_core::{SkillState, SkillStatus, SkillUpdate};
use std::collections::BTreeMap;

/// Latest known skill list per agent, keyed by agent then skill name.
#[derive(Debug, Clone, Default)]
pub struct SkillRoster {
    agents: BTreeMap<String, BTreeMap<String, SkillStatus>>,
}

impl SkillRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges an update into the agent's list. Returns true when anything
    /// changed.
    pub fn apply(&mut self, update: SkillUpdate) -> bool {
        let skills = self.agents.entry(update.agent_name).or_default();
        let mut changed = false;
        for skill in update.skills {
            if skills.get(&skill.name) != Some(&skill) {
                skills.insert(skill.name.clone(), skill);
                changed = true;
            }
        }
        changed
    }

    pub fn skills(&self, agent_name: &str) -> Vec<&SkillStatus> {
        self.agents
            .get(agent_name)
            .map(|skills| skills.values().collect())
            .unwrap_or_default()
    }

    pub fn agents(&self) -> impl Iterator<Item = &str> {
        self.agents.keys().map(String::as_str)
    }

    pub fn count(&self, agent_name: &str, state: SkillState) -> usize {
        self.agents
            .get(agent_name)
            .map(|skills| skills.values().filter(|skill| skill.status == state).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skill(name: &str, status: SkillState) -> SkillStatus {
        SkillStatus {
            name: name.to_string(),
            status,
            error: None,
        }
    }

    #[test]
    fn updates_merge_by_skill_name() {
        let mut roster = SkillRoster::new();
        assert!(roster.apply(SkillUpdate {
            agent_name: "qa".to_string(),
            skills: vec![skill("git", SkillState::Pending), skill("browser", SkillState::Pending)],
        }));
        assert!(roster.apply(SkillUpdate {
            agent_name: "qa".to_string(),
            skills: vec![skill("git", SkillState::Installed)],
        }));

        let names: Vec<(&str, SkillState)> = roster
            .skills("qa")
            .into_iter()
            .map(|skill| (skill.name.as_str(), skill.status))
            .collect();
        assert_eq!(
            names,
            vec![("browser", SkillState::Pending), ("git", SkillState::Installed)]
        );
        assert_eq!(roster.count("qa", SkillState::Installed), 1);
    }

    #[test]
    fn repeated_update_reports_no_change() {
        let mut roster = SkillRoster::new();
        let update = SkillUpdate {
            agent_name: "qa".to_string(),
            skills: vec![skill("git", SkillState::Installed)],
        };
        assert!(roster.apply(update.clone()));
        assert!(!roster.apply(update));
        assert!(roster.skills("lead").is_empty());
        assert_eq!(roster.agents().collect::<Vec<_>>(), vec!["qa"]);
    }
}

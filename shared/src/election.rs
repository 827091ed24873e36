use serde::{Deserialize, Serialize};

/// A candidate as the authority describes it. Some deployments send bare ids.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub name: Option<String>,
    pub party: Option<String>,
}

impl Candidate {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Either wire form of a candidate.
#[derive(Deserialize)]
#[serde(untagged)]
pub enum RawCandidate {
    Id(String),
    Full {
        #[serde(alias = "_id", alias = "candidateId")]
        id: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        party: Option<String>,
    },
}

impl From<RawCandidate> for Candidate {
    fn from(raw: RawCandidate) -> Self {
        match raw {
            RawCandidate::Id(id) => Candidate {
                id,
                name: None,
                party: None,
            },
            RawCandidate::Full { id, name, party } => Candidate { id, name, party },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Election {
    #[serde(alias = "_id", alias = "electionId")]
    pub id: String,
    #[serde(alias = "name")]
    pub title: String,
    #[serde(deserialize_with = "normalize_candidates", default)]
    pub candidates: Vec<Candidate>,
}

impl Election {
    pub fn candidate(&self, id: &str) -> Option<&Candidate> {
        self.candidates.iter().find(|c| c.id == id)
    }
}

fn normalize_candidates<'de, D>(deserializer: D) -> Result<Vec<Candidate>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Vec::<RawCandidate>::deserialize(deserializer)?;
    Ok(raw.into_iter().map(Candidate::from).collect())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn bare_and_structured_candidates_normalize_alike() {
        let election: Election = serde_json::from_value(json!({
            "id": "e1",
            "title": "General",
            "candidates": ["c1", {"id": "c2", "name": "Asha", "party": "Green"}]
        }))
        .unwrap();
        assert_eq!(election.candidates.len(), 2);
        assert_eq!(election.candidates[0].id, "c1");
        assert_eq!(election.candidates[0].display_name(), "c1");
        assert_eq!(election.candidate("c2").unwrap().display_name(), "Asha");
        assert_eq!(election.candidate("c2").unwrap().party.as_deref(), Some("Green"));
    }

    #[test]
    fn missing_candidate_list_is_empty() {
        let election: Election =
            serde_json::from_value(json!({"id": "e1", "title": "T"})).unwrap();
        assert!(election.candidates.is_empty());
    }
}

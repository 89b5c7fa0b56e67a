use strsim::levenshtein;

use crate::models::Person;

/// Lowercased alphanumerics only, so punctuation and spacing differences
/// never dominate the edit distance.
fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Operator-facing fuzzy lookup. Exact id matches rank first, then name
/// candidates by edit distance against the sortable name in both
/// "Last, First" and "First Last" orientations, closest first.
pub fn search_students<'a>(
    students: &'a [Person],
    name: Option<&str>,
    canvas_id: Option<u64>,
    sis_id: Option<&str>,
    max_return: usize,
) -> Vec<&'a Person> {
    let mut matches: Vec<&Person> = Vec::new();

    if let Some(id) = canvas_id {
        matches.extend(students.iter().filter(|s| s.id == id));
    }
    if let Some(sis) = sis_id {
        matches.extend(students.iter().filter(|s| s.sis_id.as_deref() == Some(sis)));
    }

    if let Some(name) = name {
        let key = normalize_name(name);
        let mut scored: Vec<(&Person, usize)> = students
            .iter()
            .map(|s| {
                let forward = normalize_name(&s.sortable_name);
                let backward: String = s
                    .sortable_name
                    .split(',')
                    .rev()
                    .map(normalize_name)
                    .collect();
                let dist = levenshtein(&key, &forward).min(levenshtein(&key, &backward));
                (s, dist)
            })
            .collect();
        scored.sort_by_key(|&(_, dist)| dist);
        matches.extend(scored.into_iter().take(max_return).map(|(s, _)| s));
    }

    let mut seen = std::collections::HashSet::new();
    matches.retain(|s| seen.insert(s.id));
    matches.truncate(max_return);
    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PersonStatus;
    use chrono::Utc;

    fn student(id: u64, sis: &str, name: &str, sortable: &str) -> Person {
        Person {
            id,
            sis_id: Some(sis.into()),
            name: name.into(),
            sortable_name: sortable.into(),
            reg_created: Utc::now(),
            reg_updated: None,
            status: PersonStatus::Active,
        }
    }

    fn roster() -> Vec<Person> {
        vec![
            student(1, "s100", "Ada Lovelace", "Lovelace, Ada"),
            student(2, "s200", "Grace Hopper", "Hopper, Grace"),
            student(3, "s300", "Alan Turing", "Turing, Alan"),
        ]
    }

    #[test]
    fn exact_id_match_ranks_first() {
        let roster = roster();
        let found = search_students(&roster, Some("grace hopper"), Some(3), None, 5);
        assert_eq!(found[0].id, 3);
        assert_eq!(found[1].id, 2);
    }

    #[test]
    fn fuzzy_match_handles_both_name_orders() {
        let roster = roster();
        let found = search_students(&roster, Some("ada lovelace"), None, None, 1);
        assert_eq!(found[0].id, 1);
        let found = search_students(&roster, Some("lovelace ada"), None, None, 1);
        assert_eq!(found[0].id, 1);
    }

    #[test]
    fn typos_still_find_the_student() {
        let roster = roster();
        let found = search_students(&roster, Some("grace hoppr"), None, None, 1);
        assert_eq!(found[0].id, 2);
    }

    #[test]
    fn sis_match_and_dedup() {
        let roster = roster();
        let found = search_students(&roster, Some("alan turing"), None, Some("s300"), 5);
        assert_eq!(found[0].id, 3);
        // The fuzzy pass finds the same student; the result holds no duplicate.
        assert_eq!(found.iter().filter(|s| s.id == 3).count(), 1);
    }

    #[test]
    fn respects_max_return() {
        let roster = roster();
        let found = search_students(&roster, Some("a"), None, None, 2);
        assert_eq!(found.len(), 2);
    }
}

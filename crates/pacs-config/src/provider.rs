//! 检查/序列属性集合
//!
//! 序列集合会减去检查集合中已有的标签，保证两者不相交。

use pacs_core::{DicomTag, Level};
use std::collections::HashSet;

use crate::schema::{DictionaryTag, Schema};

#[derive(Debug, Clone, Default)]
pub struct StudySeriesAttributeProvider {
    study_attributes: Vec<DictionaryTag>,
    series_attributes: Vec<DictionaryTag>,
    study_query_attributes: Vec<DictionaryTag>,
    series_query_attributes: Vec<DictionaryTag>,
}

/// 保序去重
fn distinct<'a>(tags: impl IntoIterator<Item = &'a DictionaryTag>) -> Vec<DictionaryTag> {
    let mut seen = HashSet::new();
    tags.into_iter()
        .filter(|t| seen.insert(t.tag))
        .cloned()
        .collect()
}

fn subtract(tags: Vec<DictionaryTag>, exclude: &[DictionaryTag]) -> Vec<DictionaryTag> {
    let excluded: HashSet<DicomTag> = exclude.iter().map(|t| t.tag).collect();
    tags.into_iter()
        .filter(|t| !excluded.contains(&t.tag))
        .collect()
}

impl StudySeriesAttributeProvider {
    pub fn with_schema(schema: &Schema) -> Self {
        let study_attributes = distinct(schema.get_fast_access_tags(Level::Study));
        let series_attributes = subtract(
            distinct(schema.get_fast_access_tags(Level::Series)),
            &study_attributes,
        );

        let study_query_attributes = distinct(
            schema
                .get_queryable_tags(Level::Study)
                .iter()
                .chain(schema.get_index_queryable(Level::Study)),
        );
        let series_query_attributes = subtract(
            distinct(
                schema
                    .get_queryable_tags(Level::Series)
                    .iter()
                    .chain(schema.get_index_queryable(Level::Series)),
            ),
            &study_query_attributes,
        );

        Self {
            study_attributes,
            series_attributes,
            study_query_attributes,
            series_query_attributes,
        }
    }

    pub fn study_attributes(&self) -> &[DictionaryTag] {
        &self.study_attributes
    }

    pub fn series_attributes(&self) -> &[DictionaryTag] {
        &self.series_attributes
    }

    pub fn study_query_attributes(&self) -> &[DictionaryTag] {
        &self.study_query_attributes
    }

    pub fn series_query_attributes(&self) -> &[DictionaryTag] {
        &self.series_query_attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pacs_core::tags;

    fn dt(tag: DicomTag) -> DictionaryTag {
        DictionaryTag::new(tag, tag.to_string())
    }

    fn ids(tags: &[DictionaryTag]) -> Vec<DicomTag> {
        tags.iter().map(|t| t.tag).collect()
    }

    #[test]
    fn test_series_attributes_exclude_study_attributes() {
        let mut schema = Schema::new();
        schema.add_fast_access(Level::Study, vec![dt(tags::PATIENT_ID), dt(tags::STUDY_DATE)]);
        schema.add_fast_access(Level::Series, vec![dt(tags::PATIENT_ID), dt(tags::MODALITY)]);

        let provider = StudySeriesAttributeProvider::with_schema(&schema);
        assert_eq!(
            ids(provider.study_attributes()),
            vec![tags::PATIENT_ID, tags::STUDY_DATE]
        );
        assert_eq!(ids(provider.series_attributes()), vec![tags::MODALITY]);
    }

    #[test]
    fn test_query_sets_are_disjoint() {
        let mut schema = Schema::new();
        schema.add_queryable(Level::Study, vec![dt(tags::ACCESSION_NUMBER), dt(tags::PATIENT_NAME)]);
        schema.add_index_queryable(Level::Study, vec![dt(tags::PATIENT_ID)]);
        schema.add_queryable(
            Level::Series,
            vec![dt(tags::PATIENT_ID), dt(tags::MODALITY), dt(tags::SERIES_NUMBER)],
        );
        schema.add_index_queryable(Level::Series, vec![dt(tags::ACCESSION_NUMBER)]);

        let provider = StudySeriesAttributeProvider::with_schema(&schema);
        let study: HashSet<DicomTag> = ids(provider.study_query_attributes()).into_iter().collect();
        let series: HashSet<DicomTag> = ids(provider.series_query_attributes()).into_iter().collect();
        assert!(study.is_disjoint(&series));
        assert_eq!(
            ids(provider.series_query_attributes()),
            vec![tags::MODALITY, tags::SERIES_NUMBER]
        );
    }

    #[test]
    fn test_empty_schema_yields_empty_sets() {
        let provider = StudySeriesAttributeProvider::with_schema(&Schema::new());
        assert!(provider.study_attributes().is_empty());
        assert!(provider.series_query_attributes().is_empty());
    }
}

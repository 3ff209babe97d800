//! The naming and labeling convention of Knitfab resources.
//!
//! Every resource Knitfab creates is named by the [`MetaSource::instance`]
//! of the domain value it was built from, and labeled from the same value.
//! Finding a resource later only needs the domain value again.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// The recommended label for the name of the application.
pub const LABEL_NAME: &str = "app.kubernetes.io/name";

/// The recommended label for the instance of the application.
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";

/// The recommended label for the component of the application.
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";

/// The recommended label for the application a resource is part of.
pub const LABEL_PART_OF: &str = "app.kubernetes.io/part-of";

/// The recommended label for the tool managing a resource.
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// The label holding the type of [`MetaSource::id`].
pub const LABEL_ID_TYPE: &str = "knitfab/id-type";

/// The label holding [`MetaSource::id`].
pub const LABEL_ID: &str = "knitfab/id";

/// The prefix of extra labels.
const EXTRA_LABEL_PREFIX: &str = "knitfab/";

/// The value of the part-of and managed-by labels.
const KNITFAB: &str = "knitfab";

/// A domain value that becomes a cluster resource.
pub trait MetaSource {
    /// Gets where the resource is positioned in Knitfab (e.g. `worker`).
    fn component(&self) -> &str;

    /// Gets the name of the application the resource runs.
    ///
    /// Resources of the same application share a name; use
    /// [`MetaSource::instance`] to name the resource itself.
    fn name(&self) -> &str {
        self.component()
    }

    /// Gets the name of the resource.
    fn instance(&self) -> &str;

    /// Gets the identifier of the domain value.
    fn id(&self) -> &str;

    /// Gets the type of [`MetaSource::id`] (e.g. `knitid`).
    fn id_type(&self) -> &str;

    /// Gets extra labels, keyed without their `knitfab/` prefix.
    fn extras(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Gets the labels of the resource.
    fn labels(&self) -> BTreeMap<String, String> {
        let mut labels: BTreeMap<String, String> = self
            .extras()
            .into_iter()
            .map(|(k, v)| (format!("{EXTRA_LABEL_PREFIX}{k}"), v))
            .collect();

        labels.extend(
            [
                (LABEL_NAME, self.name()),
                (LABEL_INSTANCE, self.instance()),
                (LABEL_COMPONENT, self.component()),
                (LABEL_PART_OF, KNITFAB),
                (LABEL_MANAGED_BY, KNITFAB),
                (LABEL_ID_TYPE, self.id_type()),
                (LABEL_ID, self.id()),
            ]
            .map(|(k, v)| (k.to_string(), v.to_string())),
        );

        labels
    }

    /// Gets the metadata of the resource.
    fn object_meta(&self, namespace: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.instance().to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(self.labels()),
            ..Default::default()
        }
    }
}

/// A domain value that builds a resource specification from a config.
///
/// Building is deterministic and has no side effects.
pub trait ResourceBuilder<C, S>: MetaSource {
    /// Builds the resource specification.
    fn build(&self, config: &C) -> S;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Cache;

    impl MetaSource for Cache {
        fn component(&self) -> &str {
            "cache"
        }

        fn instance(&self) -> &str {
            "cache-1"
        }

        fn id(&self) -> &str {
            "1"
        }

        fn id_type(&self) -> &str {
            "cacheid"
        }

        fn extras(&self) -> BTreeMap<String, String> {
            BTreeMap::from_iter([
                ("tier".to_string(), "hot".to_string()),
                ("id".to_string(), "shadowed".to_string()),
            ])
        }
    }

    #[test]
    fn labels_follow_the_convention() {
        let meta = Cache.object_meta("knitfab");
        assert_eq!(meta.name.as_deref(), Some("cache-1"));
        assert_eq!(meta.namespace.as_deref(), Some("knitfab"));

        let labels = meta.labels.unwrap();
        let expected = [
            ("app.kubernetes.io/component", "cache"),
            ("app.kubernetes.io/instance", "cache-1"),
            ("app.kubernetes.io/managed-by", "knitfab"),
            ("app.kubernetes.io/name", "cache"),
            ("app.kubernetes.io/part-of", "knitfab"),
            ("knitfab/id", "1"),
            ("knitfab/id-type", "cacheid"),
            ("knitfab/tier", "hot"),
        ];
        assert_eq!(
            labels,
            BTreeMap::from_iter(expected.map(|(k, v)| (k.to_string(), v.to_string())))
        );
    }
}

//! The node's boot-time topic-rule seed table (`spec.md` §4.5): a fixed,
//! per-subject-code keyword table the classifier is built from once at
//! startup. A subject created after boot whose `code` isn't in this table
//! falls through to `tutor_pedagogy::UNKNOWN_TOPIC` until the node restarts
//! — the classifier is a process-wide singleton by design (`spec.md` §9),
//! not a live-reconfigurable one.

use tutor_pedagogy::TopicRule;

pub struct SubjectRuleSet {
    pub code: &'static str,
    pub rules: &'static [TopicRule],
}

const MATEMATIKA: &[TopicRule] = &[
    TopicRule {
        topic: "aljabar",
        keywords: &["persamaan", "variabel", "fungsi linear", "aljabar"],
    },
    TopicRule {
        topic: "geometri",
        keywords: &["segitiga", "lingkaran", "sudut", "pythagoras", "bangun ruang"],
    },
    TopicRule {
        topic: "trigonometri",
        keywords: &["sinus", "cosinus", "tangen", "trigonometri"],
    },
    TopicRule {
        topic: "statistika",
        keywords: &["rata-rata", "median", "modus", "peluang", "statistika"],
    },
    TopicRule {
        topic: "kalkulus",
        keywords: &["turunan", "integral", "limit"],
    },
];

const FISIKA: &[TopicRule] = &[
    TopicRule {
        topic: "mekanika",
        keywords: &["gaya", "gerak lurus", "hukum newton", "momentum"],
    },
    TopicRule {
        topic: "termodinamika",
        keywords: &["kalor", "suhu", "termodinamika"],
    },
    TopicRule {
        topic: "listrik_magnet",
        keywords: &["arus listrik", "medan magnet", "rangkaian", "tegangan"],
    },
    TopicRule {
        topic: "gelombang",
        keywords: &["gelombang", "frekuensi", "resonansi"],
    },
];

const KIMIA: &[TopicRule] = &[
    TopicRule {
        topic: "stoikiometri",
        keywords: &["mol", "stoikiometri", "persamaan reaksi"],
    },
    TopicRule {
        topic: "ikatan_kimia",
        keywords: &["ikatan kovalen", "ikatan ion", "ikatan kimia"],
    },
    TopicRule {
        topic: "asam_basa",
        keywords: &["asam", "basa", "ph", "titrasi"],
    },
    TopicRule {
        topic: "termokimia",
        keywords: &["entalpi", "termokimia", "eksoterm", "endoterm"],
    },
];

const BIOLOGI: &[TopicRule] = &[
    TopicRule {
        topic: "sel",
        keywords: &["sel", "organel", "membran sel"],
    },
    TopicRule {
        topic: "genetika",
        keywords: &["gen", "kromosom", "pewarisan sifat", "genetika"],
    },
    TopicRule {
        topic: "ekosistem",
        keywords: &["ekosistem", "rantai makanan", "populasi"],
    },
];

/// Known curriculum subjects, matched against [`tutor_types::Subject::code`].
pub const SUBJECT_RULE_SETS: &[SubjectRuleSet] = &[
    SubjectRuleSet { code: "MTK", rules: MATEMATIKA },
    SubjectRuleSet { code: "FIS", rules: FISIKA },
    SubjectRuleSet { code: "KIM", rules: KIMIA },
    SubjectRuleSet { code: "BIO", rules: BIOLOGI },
];

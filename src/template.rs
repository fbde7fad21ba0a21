//! Step templates: the fixed sign-off topology for each form type
use std::fmt;

/// One entry of a template, instantiated into an `ApprovalStep` at seeding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepTemplate {
    pub code: &'static str,
    pub label: &'static str,
    pub is_external: bool,
    pub auto_approve_by_creator: bool,
}

const fn internal(code: &'static str, label: &'static str) -> StepTemplate {
    StepTemplate {
        code,
        label,
        is_external: false,
        auto_approve_by_creator: false,
    }
}

const fn external(code: &'static str, label: &'static str) -> StepTemplate {
    StepTemplate {
        code,
        label,
        is_external: true,
        auto_approve_by_creator: false,
    }
}

const fn auto(code: &'static str, label: &'static str) -> StepTemplate {
    StepTemplate {
        code,
        label,
        is_external: false,
        auto_approve_by_creator: true,
    }
}

const INVENTORY_SCHEDULING: &[StepTemplate] = &[
    auto("prepared_by", "Prepared by"),
    internal("noted_by", "Noted by"),
    internal("approved_by", "Approved by"),
];

const OFF_CAMPUS: &[StepTemplate] = &[
    internal("issued_by", "Issued by"),
    external("external_approved_by", "Approved by (external)"),
];

const TRANSFER: &[StepTemplate] = &[
    auto("prepared_by", "Prepared by"),
    internal("approved_by", "Approved by"),
];

const TURNOVER_DISPOSAL: &[StepTemplate] = &[
    auto("prepared_by", "Prepared by"),
    external("external_noted_by", "Noted by (external)"),
    internal("noted_by", "Noted by"),
];

const DEFAULT: &[StepTemplate] = &[auto("prepared", "Prepared")];

/// Tag selecting the template a new request is seeded from. Unknown tags are
/// kept verbatim and fall back to the single auto-approved step.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FormType {
    InventoryScheduling,
    OffCampus,
    Transfer,
    TurnoverDisposal,
    Other(String),
}

impl FormType {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "inventory_scheduling" => FormType::InventoryScheduling,
            "off_campus" => FormType::OffCampus,
            "transfer" => FormType::Transfer,
            "turnover_disposal" => FormType::TurnoverDisposal,
            other => FormType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FormType::InventoryScheduling => "inventory_scheduling",
            FormType::OffCampus => "off_campus",
            FormType::Transfer => "transfer",
            FormType::TurnoverDisposal => "turnover_disposal",
            FormType::Other(tag) => tag,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, FormType::Other(_))
    }
}

impl fmt::Display for FormType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for FormType {
    fn from(value: &str) -> Self {
        FormType::from_tag(value)
    }
}

// stored as its tag so new form types never need a re-encode
impl<C> minicbor::Encode<C> for FormType {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.str(self.as_str())?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for FormType {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        Ok(FormType::from_tag(d.str()?))
    }
}

/// Ordered steps to instantiate for `form_type`.
pub fn steps_for(form_type: &FormType) -> &'static [StepTemplate] {
    match form_type {
        FormType::InventoryScheduling => INVENTORY_SCHEDULING,
        FormType::OffCampus => OFF_CAMPUS,
        FormType::Transfer => TRANSFER,
        FormType::TurnoverDisposal => TURNOVER_DISPOSAL,
        FormType::Other(tag) => {
            tracing::debug!(form_type = %tag, "unknown form type, using default template");
            DEFAULT
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(form: &str) -> Vec<(&'static str, bool, bool)> {
        steps_for(&FormType::from_tag(form))
            .iter()
            .map(|s| (s.code, s.is_external, s.auto_approve_by_creator))
            .collect()
    }

    #[test]
    fn known_topologies() {
        assert_eq!(
            shape("inventory_scheduling"),
            vec![
                ("prepared_by", false, true),
                ("noted_by", false, false),
                ("approved_by", false, false)
            ]
        );
        assert_eq!(
            shape("off_campus"),
            vec![("issued_by", false, false), ("external_approved_by", true, false)]
        );
        assert_eq!(
            shape("transfer"),
            vec![("prepared_by", false, true), ("approved_by", false, false)]
        );
        assert_eq!(
            shape("turnover_disposal"),
            vec![
                ("prepared_by", false, true),
                ("external_noted_by", true, false),
                ("noted_by", false, false)
            ]
        );
    }

    #[test]
    fn unknown_form_falls_back_to_single_prepared_step() {
        let form = FormType::from_tag("equipment_loan");
        assert!(!form.is_known());
        assert_eq!(shape("equipment_loan"), vec![("prepared", false, true)]);
    }

    #[test]
    fn tags_survive_encoding() {
        for tag in ["transfer", "equipment_loan"] {
            let form = FormType::from_tag(tag);
            let bytes = minicbor::to_vec(&form).unwrap();
            let decoded: FormType = minicbor::decode(&bytes).unwrap();
            assert_eq!(decoded.as_str(), tag);
        }
    }
}

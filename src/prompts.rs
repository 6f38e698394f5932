//! Prompts for report synthesis.
//!
//! Centralising the prompt here keeps the output contract in one place:
//! the field names below are exactly the ones
//! [`crate::synthesis::parse_synthesis_response`] maps, so a change to one
//! side is a visible diff against the other.

/// System message sent with every synthesis request.
pub const SYNTHESIS_SYSTEM_PROMPT: &str = "You extract structured data from veterinary clinical reports. \
You reply with a single JSON object and nothing else.";

/// Output contract. `{document}` is replaced with the extracted text.
pub const SYNTHESIS_INSTRUCTIONS: &str = r#"Extract the information in the veterinary report below into the JSON structure that follows.

RULES:
1. Reply with ONE JSON object only. No prose before or after it, no code fences.
2. Copy values literally as they are written. Do not infer, summarise, translate or correct.
3. When a value is missing, use "" for text fields and [] for lists. Never omit a key and never use null.
4. Each bullet, numbered item or line of a list in the report becomes one array element.
5. The report may be signed by several veterinarians. List every signer in "veterinarians", in the order they appear.
6. The referring veterinarian is whoever requested the study; do not list them as a signer unless they also signed.
7. The text contains lines such as "--- PAGE 2 ---". They are page boundaries: never copy them into any value, and never repeat content that spans two pages.
8. "studyType" must be one of: radiograph, ultrasound, lab-analysis, consultation, other.
9. "sex" must be one of: male, female, neutered, spayed, unknown.

JSON STRUCTURE:
{
  "studyInfo": {
    "date": "",
    "studyType": "",
    "requestReason": "",
    "referringVeterinarian": ""
  },
  "patient": {
    "name": "",
    "species": "",
    "breed": "",
    "age": "",
    "sex": "",
    "weight": "",
    "idTag": ""
  },
  "guardian": {
    "name": "",
    "phone": "",
    "email": "",
    "address": ""
  },
  "veterinarians": [
    { "name": "", "licenseNumber": "", "clinic": "" }
  ],
  "findings": {
    "summary": "",
    "items": []
  },
  "conclusion": {
    "primaryDiagnoses": [],
    "differentials": [],
    "additionalNotes": ""
  },
  "treatment": {
    "recommendations": []
  },
  "additional": {
    "narrative": "",
    "observations": [],
    "recommendations": [],
    "medications": [],
    "procedures": []
  }
}

REPORT:
"""
{document}
""""#;

/// Build the full synthesis instruction payload for `document`.
pub fn build_synthesis_prompt(document: &str) -> String {
    SYNTHESIS_INSTRUCTIONS.replace("{document}", document.trim())
}

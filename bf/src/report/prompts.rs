//! Prompt templates for the report pipeline stages.
//!
//! Templates use Handlebars syntax and are embedded as defaults; the data
//! each stage passes in is a plain JSON value so prompts and pipeline stay
//! decoupled.

use handlebars::Handlebars;
use serde_json::Value;
use tracing::debug;

/// Name of the built-in fallback template
pub const FALLBACK_TEMPLATE_NAME: &str = "综合分析模板";

/// Built-in single-section fallback used when template selection fails or
/// no template directory is configured.
pub const FALLBACK_TEMPLATE: &str = "\
# 1.0 综合分析

- 事件概述与背景
- 舆情走势与关键节点
- 各方观点与情绪分析
- 风险研判与应对建议
";

pub const SYSTEM_TEMPLATE_SELECTION: &str = "\
你是报告模板策划师。根据用户的分析主题与三个分析引擎的产出，从候选模板中选择最合适的一个。\
输出严格的JSON对象：{\"template_name\": string, \"template_content\": string, \"selection_reason\": string}，\
template_content 必须是所选模板的完整 Markdown。不要输出任何JSON以外的内容。";

pub const SYSTEM_DOCUMENT_LAYOUT: &str = "\
你是舆情报告的文档设计师。基于模板骨架与三个引擎的内容，设计整书的标题系统与视觉主题。\
输出严格的JSON对象，包含：title、subtitle、tagline、tocTitle、hero、themeTokens、tocPlan、layoutNotes。\
tocPlan 是数组，每项包含 chapterId、display、description，可选 anchor、allowSwot、allowPest；\
全书最多一个章节 allowSwot=true，最多一个章节 allowPest=true。不要输出任何JSON以外的内容。";

pub const SYSTEM_WORD_BUDGET: &str = "\
你是报告的篇幅规划师。为每个章节分配目标字数与写作重点。\
输出严格的JSON对象：{\"totalWords\": number, \"globalGuidelines\": [string], \
\"chapters\": [{\"chapterId\": string, \"targetWords\": number, \"minWords\": number, \
\"maxWords\": number, \"emphasis\": [string], \"rationale\": string}]}。不要输出任何JSON以外的内容。";

pub const SYSTEM_CHAPTER_GENERATION: &str = "\
你是报告章节撰写人。只负责当前一个章节，输出该章节的严格JSON（章节IR）：\
{\"chapterId\": string, \"title\": string, \"anchor\": string, \"order\": number, \"blocks\": [Block]}。\
Block.type 取值限于 heading/paragraph/list/table/swotTable/pestTable/blockquote/engineQuote/callout/\
kpiGrid/widget/code/math/figure/hr/toc。paragraph 由 inlines 组成，每个 inline 是 {\"text\": string, \
\"marks\": [{\"type\": ...}]}。只有 allowSwot 的章节可以使用 swotTable，只有 allowPest 的章节可以使用 \
pestTable。第一块必须是与章节标题一致的 heading。不要输出任何JSON以外的内容。";

pub const SYSTEM_JSON_REPAIR: &str = "\
你是JSON修复助手。把给出的损坏JSON改写为语义等价的合法JSON，保留全部原有内容，\
不新增字段。只输出修复后的JSON本身。";

pub const SYSTEM_PROMPT_CHAPTER_JSON_RECOVERY: &str = "\
你是JSON修复专家。上一位撰写人为某章节生成的输出无法解析为合法的章节IR。\
根据给出的原始输出与章节要求，重建该章节的严格JSON，结构与章节IR一致，\
尽量保留原始文本内容。只输出修复后的JSON对象本身。";

const TEMPLATE_SELECTION_USER: &str = "\
分析主题：{{query}}

候选模板列表：
{{#each templates}}
- {{this.name}}
{{/each}}
{{#if custom_template}}
用户提供了自定义模板，优先评估它是否可用：
{{custom_template}}
{{/if}}

三个引擎的报告摘要：
[QUERY]
{{reports.query_engine}}

[MEDIA]
{{reports.media_engine}}

[INSIGHT]
{{reports.insight_engine}}

论坛讨论记录：
{{forum_logs}}
";

const DOCUMENT_LAYOUT_USER: &str = "\
分析主题：{{query}}

模板概览：
{{template_overview}}

模板全文：
{{template_content}}

章节骨架：
{{sections}}

三个引擎的报告：
[QUERY]
{{reports.query_engine}}

[MEDIA]
{{reports.media_engine}}

[INSIGHT]
{{reports.insight_engine}}

论坛讨论记录：
{{forum_logs}}
";

const WORD_BUDGET_USER: &str = "\
分析主题：{{query}}

文档设计稿：
{{layout}}

章节骨架：
{{sections}}

模板概览：
{{template_overview}}

请为以上每个章节给出字数规划。
";

const CHAPTER_GENERATION_USER: &str = "\
分析主题：{{query}}

当前章节：
{{section}}

章节字数与重点要求：
{{directive}}

全书主题 tokens：
{{theme_tokens}}

{{#if allow_swot}}本章允许使用 swotTable。{{/if}}
{{#if allow_pest}}本章允许使用 pestTable。{{/if}}

三个引擎的报告：
[QUERY]
{{reports.query_engine}}

[MEDIA]
{{reports.media_engine}}

[INSIGHT]
{{reports.insight_engine}}

论坛讨论记录：
{{forum_logs}}
";

const CHAPTER_JSON_RECOVERY_USER: &str = "\
章节要求：
{{section}}

生成时使用的上下文（节选）：
{{context_digest}}

无法解析的原始输出：
{{raw_output}}

解析错误：
{{error}}
";

/// Registered prompt templates, rendered per stage call.
pub struct PromptLibrary {
    hbs: Handlebars<'static>,
}

impl Default for PromptLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptLibrary {
    pub fn new() -> Self {
        let mut hbs = Handlebars::new();
        // Prompt text is not HTML.
        hbs.register_escape_fn(handlebars::no_escape);
        for (name, template) in [
            ("template_selection", TEMPLATE_SELECTION_USER),
            ("document_layout", DOCUMENT_LAYOUT_USER),
            ("word_budget", WORD_BUDGET_USER),
            ("chapter_generation", CHAPTER_GENERATION_USER),
            ("chapter_json_recovery", CHAPTER_JSON_RECOVERY_USER),
        ] {
            hbs.register_template_string(name, template)
                .expect("embedded prompt template parses");
        }
        Self { hbs }
    }

    pub fn render(&self, name: &str, data: &Value) -> eyre::Result<String> {
        debug!(name, "PromptLibrary::render");
        Ok(self.hbs.render(name, data)?)
    }
}
